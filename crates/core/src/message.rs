//! The dispatch message carried by the task queue.

use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// Query used when a submission leaves the query blank.
pub const DEFAULT_QUERY: &str = "Analyze this financial document for investment insights";

/// Everything a worker needs to run one job attempt without re-reading the
/// job row. Serialized as JSON into the queue payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub job_id: JobId,
    /// Where the submission path stored the upload.
    pub file_path: String,
    pub query: String,
    pub filename: String,
    /// Telemetry only; recorded into the activity log.
    pub client_origin: Option<String>,
    pub file_size: Option<i64>,
}

impl DispatchMessage {
    pub fn new(
        job_id: JobId,
        file_path: impl Into<String>,
        query: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            file_path: file_path.into(),
            query: query.into(),
            filename: filename.into(),
            client_origin: None,
            file_size: None,
        }
    }

    pub fn with_client_origin(mut self, origin: impl Into<String>) -> Self {
        self.client_origin = Some(origin.into());
        self
    }

    pub fn with_file_size(mut self, size: i64) -> Self {
        self.file_size = Some(size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_stable_json_shape() {
        let msg = DispatchMessage::new(JobId::new(), "data/x.pdf", "q", "x.pdf")
            .with_client_origin("203.0.113.7")
            .with_file_size(10);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["file_path"], "data/x.pdf");
        assert_eq!(json["file_size"], 10);

        let back: DispatchMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}
