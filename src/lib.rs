//! Library crate for scan-dispatch: runs an external port scanner as
//! queued jobs with bounded parallelism and streams its progress.
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod locate;
pub mod parser;
pub mod ports;
pub mod runner;
pub mod server;
pub mod store;
pub mod target;
pub mod types;

pub use dispatcher::Dispatcher;
pub use error::ScanError;
pub use runner::{ProcessRunner, ScanExecutor};
