pub mod activity;
pub mod extractor;
pub mod manager;
pub mod scheduler;
pub mod server;
pub mod state;

pub use manager::Manager;
pub use scheduler::SchedulerError;
pub use state::SharedState;
