//! Local file details and per-table row counts of a pulled database.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl LocalFile {
    pub fn inspect(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("table name `{0}` is not a plain identifier")]
    BadTableName(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// `SELECT COUNT(*)` for every table. Opens the file read-only.
pub fn count_rows(path: &Path, tables: &[String]) -> Result<BTreeMap<String, u64>, StatsError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut counts = BTreeMap::new();
    for table in tables {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StatsError::BadTableName(table.clone()));
        }
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| {
            row.get(0)
        })?;
        counts.insert(table.clone(), count.max(0) as u64);
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE DWJJOB (id INTEGER, dwjLoad TEXT);
             CREATE TABLE DWVVEH (id INTEGER);
             INSERT INTO DWJJOB VALUES (1, 'A'), (2, 'A'), (3, 'B');
             INSERT INTO DWVVEH VALUES (1);",
        )
        .unwrap();
    }

    #[test]
    fn counts_each_table() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("sql.db");
        seed(&db);
        let counts = count_rows(&db, &["DWJJOB".into(), "DWVVEH".into()]).unwrap();
        assert_eq!(counts["DWJJOB"], 3);
        assert_eq!(counts["DWVVEH"], 1);
    }

    #[test]
    fn missing_table_is_an_error() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("sql.db");
        seed(&db);
        assert!(count_rows(&db, &["NOPE".into()]).is_err());
        assert!(matches!(
            count_rows(&db, &["x; DROP TABLE DWJJOB".into()]),
            Err(StatsError::BadTableName(_))
        ));
    }

    #[test]
    fn inspect_reports_size() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("blob");
        std::fs::write(&file, b"12345").unwrap();
        let info = LocalFile::inspect(&file).unwrap();
        assert_eq!(info.size, 5);
        assert!(info.modified.is_some());
    }
}
