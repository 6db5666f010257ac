use std::collections::VecDeque;
use std::time::Duration;

/// Maximum lines a single run keeps. Older lines are dropped first.
pub const TRACE_LIMIT: usize = 256;

/// Per-run diagnostic trace. Only surfaced when a run fails.
#[derive(Debug, Default, Clone)]
pub struct Trace {
    lines: VecDeque<String>,
    dropped: usize,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == TRACE_LIMIT {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line.into());
    }

    pub fn step(&mut self, label: &str, elapsed: Duration, ok: bool) {
        let verdict = if ok { "ok" } else { "failed" };
        self.push(format!("step {label}: {verdict} in {}ms", elapsed.as_millis()));
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn into_lines(self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.lines.len() + 1);
        if self.dropped > 0 {
            out.push(format!("... {} earlier lines dropped", self.dropped));
        }
        out.extend(self.lines);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_is_bounded() {
        let mut trace = Trace::new();
        for i in 0..TRACE_LIMIT + 10 {
            trace.push(format!("line {i}"));
        }
        assert_eq!(trace.len(), TRACE_LIMIT);
        let lines = trace.into_lines();
        assert_eq!(lines[0], "... 10 earlier lines dropped");
        assert_eq!(lines[1], "line 10");
    }
}
