pub mod config;
pub mod core;
pub mod error;
pub mod journal;
pub mod log;
pub mod orchestration;
pub mod pipeline;

pub use error::{Error, Result};
pub use orchestration::{RunContext, RunOutcome, RunReport, RunStores, Scheduler};
