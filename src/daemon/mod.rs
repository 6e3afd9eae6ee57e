//! Command daemon — long-lived HTTP process that resolves manifest
//! commands and executes them under a concurrency limit.

pub mod client;
pub mod exec;
pub mod routes;
pub mod state;

pub use client::DaemonClient;
pub use exec::{ExecOrigin, ExecutionJob, JobStatus};
pub use routes::daemon_routes;
pub use state::{DaemonState, DaemonStatus};
