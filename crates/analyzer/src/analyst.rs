//! Heuristic financial document analyst.
//!
//! Scans the document for monetary figures, percentages, and risk language,
//! then renders a sectioned report addressing the query. Deliberately
//! self-contained: no network, no model downloads.

use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::config::AnalyzerConfig;
use crate::document;
use crate::{Analyzer, AnalyzerError};

const RISK_KEYWORDS: &[&str] = &[
    "risk", "liability", "liabilities", "debt", "impairment", "litigation", "default", "covenant",
];

fn money_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[$€£]\s?\d[\d,]*(?:\.\d+)?\s?(?:[MBK]|million|billion)?").unwrap())
}

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?\s?%").unwrap())
}

/// The built-in analyzer implementation.
#[derive(Debug, Clone)]
pub struct DocumentAnalyst {
    config: AnalyzerConfig,
}

impl DocumentAnalyst {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    fn render_report(&self, query: &str, text: &str) -> String {
        let figures: Vec<&str> = money_re().find_iter(text).map(|m| m.as_str()).take(20).collect();
        let percents: Vec<&str> = percent_re().find_iter(text).map(|m| m.as_str()).take(20).collect();

        let query_terms: Vec<String> = query
            .split_whitespace()
            .filter(|w| w.len() > 3)
            .map(|w| w.to_lowercase())
            .collect();

        let mut relevant_lines = Vec::new();
        let mut risk_lines = Vec::new();
        for line in text.lines() {
            let lower = line.to_lowercase();
            if relevant_lines.len() < 8 && query_terms.iter().any(|t| lower.contains(t)) {
                relevant_lines.push(line.trim());
            }
            if risk_lines.len() < 8 && RISK_KEYWORDS.iter().any(|k| lower.contains(k)) {
                risk_lines.push(line.trim());
            }
        }

        let mut report = String::new();
        report.push_str("## Executive Summary\n");
        report.push_str(&format!("Query: {query}\n"));
        if relevant_lines.is_empty() {
            report.push_str(
                "No passages directly matching the query were found; the figures below cover the document as a whole.\n",
            );
        } else {
            for line in &relevant_lines {
                report.push_str(&format!("- {line}\n"));
            }
        }

        report.push_str("\n## Key Figures\n");
        if figures.is_empty() && percents.is_empty() {
            report.push_str("No monetary figures or percentages were found in the document.\n");
        } else {
            if !figures.is_empty() {
                report.push_str(&format!("Amounts: {}\n", figures.join(", ")));
            }
            if !percents.is_empty() {
                report.push_str(&format!("Rates: {}\n", percents.join(", ")));
            }
        }

        report.push_str("\n## Risk Indicators\n");
        if risk_lines.is_empty() {
            report.push_str("No explicit risk language was detected.\n");
        } else {
            for line in &risk_lines {
                report.push_str(&format!("- {line}\n"));
            }
        }

        report.push_str(&format!(
            "\n---\nGenerated by {} (embeddings: {}).\n",
            self.config.model, self.config.embeddings_model
        ));
        report
    }
}

#[async_trait]
impl Analyzer for DocumentAnalyst {
    async fn execute(&self, file_path: &Path, query: &str) -> Result<String, AnalyzerError> {
        let path = file_path.to_path_buf();
        let text = tokio::task::spawn_blocking(move || document::extract_text(&path))
            .await
            .map_err(|e| AnalyzerError::Analysis(format!("extraction task aborted: {e}")))??;

        debug!(chars = text.len(), "document extracted");
        Ok(self.render_report(query, &text))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn analyst() -> DocumentAnalyst {
        DocumentAnalyst::new(AnalyzerConfig::default())
    }

    #[tokio::test]
    async fn report_surfaces_figures_and_query_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Revenue grew 12% to $4.2M in fiscal 2025.").unwrap();
        writeln!(file, "Long-term debt remains a material risk.").unwrap();

        let report = analyst()
            .execute(file.path(), "how did revenue develop")
            .await
            .unwrap();

        assert!(report.contains("$4.2M"));
        assert!(report.contains("12%"));
        assert!(report.contains("Revenue grew"));
        assert!(report.contains("## Risk Indicators"));
        assert!(report.contains("material risk"));
    }

    #[tokio::test]
    async fn missing_document_fails() {
        let err = analyst()
            .execute(Path::new("/nonexistent/report.pdf"), "q")
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Document(_)));
    }

    #[tokio::test]
    async fn report_carries_model_tag() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "plain text").unwrap();

        let config = AnalyzerConfig {
            model: "test-model".into(),
            ..AnalyzerConfig::default()
        };
        let report = DocumentAnalyst::new(config)
            .execute(file.path(), "q")
            .await
            .unwrap();
        assert!(report.contains("test-model"));
    }
}
