//! `finsight-api` — HTTP surface of the analysis pipeline.

pub mod app;
