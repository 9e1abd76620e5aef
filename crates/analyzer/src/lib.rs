//! `finsight-analyzer`
//!
//! **Responsibility:** the document-analysis capability behind the pipeline.
//!
//! This crate is intentionally opaque to the rest of the system:
//! - The pipeline only sees `execute(file_path, query) -> text`.
//! - Whatever orchestration an implementation performs internally (multi-step
//!   reasoning, tool calls, retries) is its own concern, never the pipeline's.
//! - All tuning lives in an explicit `AnalyzerConfig` handed over at
//!   construction; there is no ambient process-wide state.

pub mod analyst;
pub mod config;
pub mod document;

use std::path::Path;

use async_trait::async_trait;

pub use analyst::DocumentAnalyst;
pub use config::AnalyzerConfig;

/// Analyzer failure, caught per attempt by the worker.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    /// The document could not be read or decoded.
    #[error("failed to read document: {0}")]
    Document(String),

    /// The analysis itself failed.
    #[error("analysis failed: {0}")]
    Analysis(String),
}

/// Document analysis capability.
///
/// Implementations may run long; the worker bounds every invocation with its
/// own deadlines, so `execute` does not need to time itself out.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn execute(&self, file_path: &Path, query: &str) -> Result<String, AnalyzerError>;
}
