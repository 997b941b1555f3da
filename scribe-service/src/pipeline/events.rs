//! Stream events.
//!
//! One JSON object per line, discriminated by `type`. The producer writes
//! typed events into a channel; serialization to lines happens at the
//! transport edge.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::fields::StructuredRecord;
use crate::ocr::ProviderRole;

use super::job::JobOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Emitted before a job starts
    Progress {
        /// 1-based
        current: usize,
        total: usize,
        filename: String,
        percentage: u8,
    },
    /// Emitted when a job finishes, successfully or not
    Result { result: FileResult },
    /// Always the last event of a batch
    Complete { summary: BatchSummary },
}

impl StreamEvent {
    pub fn progress(current: usize, total: usize, filename: impl Into<String>) -> Self {
        StreamEvent::Progress {
            current,
            total,
            filename: filename.into(),
            percentage: percentage(current, total),
        }
    }

    /// Serialize as one newline-terminated line
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. })
    }
}

/// Share of the batch finished before job `current` (1-based) starts
pub fn percentage(current: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (current.saturating_sub(1).min(total) * 100 / total) as u8
}

/// Result of one file as reported to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileResult {
    pub filename: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<StructuredRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_provider: Option<ProviderRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_confidence: Option<f32>,
}

impl FileResult {
    pub fn from_outcome(filename: &str, outcome: &JobOutcome) -> Self {
        let processing_time = Some(outcome.elapsed().as_secs_f64());
        match outcome {
            JobOutcome::Success {
                record, extraction, ..
            } => Self {
                filename: filename.to_string(),
                success: true,
                data: Some(record.clone()),
                error: None,
                error_kind: None,
                processing_time,
                ocr_provider: Some(extraction.provider),
                ocr_confidence: Some(extraction.confidence),
            },
            JobOutcome::Failure {
                error,
                record,
                extraction,
                ..
            } => Self {
                filename: filename.to_string(),
                success: false,
                data: record.clone(),
                error: Some(error.to_string()),
                error_kind: Some(error.kind),
                processing_time,
                ocr_provider: extraction.as_ref().map(|e| e.provider),
                ocr_confidence: extraction.as_ref().map(|e| e.confidence),
            },
        }
    }
}

/// Aggregate over every job of a batch, in submission order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_files: usize,
    /// Successful jobs
    pub processed: usize,
    pub failed: usize,
    pub results: Vec<FileResult>,
}

impl BatchSummary {
    pub fn from_results(results: Vec<FileResult>) -> Self {
        let processed = results.iter().filter(|r| r.success).count();
        Self {
            total_files: results.len(),
            processed,
            failed: results.len() - processed,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipeline::job::{JobError, Stage};

    #[test]
    fn test_percentage_counts_finished_jobs() {
        assert_eq!(percentage(1, 4), 0);
        assert_eq!(percentage(2, 4), 25);
        assert_eq!(percentage(3, 3), 66);
        assert_eq!(percentage(0, 0), 100);
    }

    #[test]
    fn test_progress_wire_format() {
        let line = StreamEvent::progress(2, 3, "b.pdf").to_line().unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "progress", "current": 2, "total": 3, "filename": "b.pdf", "percentage": 33})
        );
    }

    #[test]
    fn test_failure_result_omits_absent_fields() {
        let outcome = JobOutcome::Failure {
            error: JobError::new(ErrorKind::MalformedDocument, Stage::Rasterizing, "file is empty"),
            record: None,
            extraction: None,
            elapsed: Duration::from_millis(1500),
        };
        let event = StreamEvent::Result {
            result: FileResult::from_outcome("empty.pdf", &outcome),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "result",
                "result": {
                    "filename": "empty.pdf",
                    "success": false,
                    "error": "file is empty",
                    "error_kind": "malformed_document",
                    "processing_time": 1.5
                }
            })
        );
    }

    #[test]
    fn test_summary_counts() {
        let ok = FileResult {
            filename: "a.pdf".to_string(),
            success: true,
            data: None,
            error: None,
            error_kind: None,
            processing_time: None,
            ocr_provider: None,
            ocr_confidence: None,
        };
        let bad = FileResult {
            success: false,
            ..ok.clone()
        };
        let summary = BatchSummary::from_results(vec![ok, bad.clone(), bad]);
        assert_eq!((summary.total_files, summary.processed, summary.failed), (3, 1, 2));
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let event: StreamEvent = serde_json::from_str(
            r#"{"type":"result","result":{"filename":"a.pdf","success":true,"extra":1}}"#,
        )
        .unwrap();
        assert!(matches!(event, StreamEvent::Result { result } if result.success));
    }
}
