pub mod bridge;
pub mod config;
pub mod escalation;
pub mod ipc;
pub mod paths;
pub mod pipeline;
pub mod probe;
pub mod runner;
pub mod stats;
pub mod trace;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;
