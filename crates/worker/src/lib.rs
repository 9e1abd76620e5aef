//! `finsight-worker` — the analysis worker pool.
//!
//! A fixed-size pool of executors pulls dispatch messages off the task
//! queue, runs the analyzer under soft/hard deadlines, and writes outcomes
//! back to the stores. Failure handling is deterministic: every delivery
//! eventually resolves its job to `completed` or `failed`, or is left
//! unacknowledged for redelivery.

pub mod config;
pub mod pool;

pub use config::WorkerConfig;
pub use pool::{WorkerDeps, WorkerPool, WorkerPoolHandle};
