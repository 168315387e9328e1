mod util;

pub mod aggregate;
pub mod cli;
pub mod collector;
pub mod coordinator;
pub mod output;
pub mod probe;
pub mod report;
pub mod runner;
pub mod server;

pub use report::{AttemptRecord, Report, ServerReport};
pub use runner::{AttemptDriver, EngineOpts, LoadEngine, Work};
