//! Analyzer configuration.

/// Tuning handed to an analyzer at construction.
///
/// Model and embeddings selection are opaque strings: the pipeline records
/// and forwards them but attaches no meaning. Defaults match the hosted
/// setup; override via `ANALYZER_MODEL` / `EMBEDDINGS_MODEL` at the binary
/// edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerConfig {
    pub model: String,
    pub embeddings_model: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            model: "finsight-heuristic-v1".to_string(),
            embeddings_model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
        }
    }
}

impl AnalyzerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            model: std::env::var("ANALYZER_MODEL").unwrap_or(defaults.model),
            embeddings_model: std::env::var("EMBEDDINGS_MODEL").unwrap_or(defaults.embeddings_model),
        }
    }
}
