//! Per-document job: input, state machine and outcome.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::config::LimitsConfig;
use crate::error::ErrorKind;
use crate::fields::StructuredRecord;
use crate::ocr::{ExtractionResult, ProviderRole};

/// One input file of a batch
#[derive(Debug, Clone)]
pub struct DocumentJob {
    /// Position within the batch, starting at 0
    pub index: usize,
    pub filename: String,
    pub bytes: Bytes,
}

impl DocumentJob {
    pub fn new(index: usize, filename: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            index,
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }

    /// Name, extension and size checks done before any rendering
    pub fn check_input(&self, limits: &LimitsConfig) -> Result<(), JobError> {
        if self.filename.trim().is_empty() {
            return Err(JobError::new(
                ErrorKind::InvalidInput,
                Stage::Rasterizing,
                "File has no name",
            ));
        }

        let extension = std::path::Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !limits
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
        {
            return Err(JobError::new(
                ErrorKind::InvalidInput,
                Stage::Rasterizing,
                format!(
                    "Unsupported file type '{}' (allowed: {})",
                    extension,
                    limits.allowed_extensions.join(", ")
                ),
            ));
        }

        let size = self.bytes.len() as u64;
        if size > limits.max_file_size_bytes {
            return Err(JobError::new(
                ErrorKind::InvalidInput,
                Stage::Rasterizing,
                format!(
                    "File too large: {} bytes (max {} bytes)",
                    size, limits.max_file_size_bytes
                ),
            ));
        }
        Ok(())
    }
}

/// Pipeline stage a failure originated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Rasterizing,
    Extracting,
    Structuring,
    Persisting,
}

/// Failure carried by a `Failure` outcome
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }
}

/// How a finished job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
}

/// Lifecycle of one job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Rasterizing,
    Extracting(ProviderRole),
    Structuring,
    Persisting,
    Done(Verdict),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal job transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

impl JobState {
    fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Rasterizing => 1,
            JobState::Extracting(ProviderRole::Primary) => 2,
            JobState::Extracting(ProviderRole::Fallback) => 3,
            JobState::Structuring => 4,
            JobState::Persisting => 5,
            JobState::Done(_) => 6,
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, JobState::Done(_))
    }

    /// Stage a failure in this state is attributed to
    pub fn stage(self) -> Stage {
        match self {
            JobState::Queued | JobState::Rasterizing => Stage::Rasterizing,
            JobState::Extracting(_) => Stage::Extracting,
            JobState::Structuring => Stage::Structuring,
            JobState::Persisting | JobState::Done(_) => Stage::Persisting,
        }
    }

    /// Move to `next`. A job can fail from any live state but only
    /// succeeds once its record has been persisted.
    pub fn advance(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        let legal = match next {
            JobState::Done(Verdict::Success) => *self == JobState::Persisting,
            JobState::Done(Verdict::Failure) => !self.is_done(),
            _ => next.rank() > self.rank(),
        };
        if !legal {
            return Err(InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

/// OCR details reported alongside an outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionMeta {
    pub provider: ProviderRole,
    pub provider_name: String,
    pub confidence: f32,
    pub page_count: usize,
}

impl From<&ExtractionResult> for ExtractionMeta {
    fn from(result: &ExtractionResult) -> Self {
        Self {
            provider: result.provider,
            provider_name: result.provider_name.clone(),
            confidence: result.confidence,
            page_count: result.page_count,
        }
    }
}

/// Exactly one per job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success {
        record: StructuredRecord,
        extraction: ExtractionMeta,
        elapsed: Duration,
    },
    Failure {
        error: JobError,
        /// Present when extraction succeeded but persisting did not
        record: Option<StructuredRecord>,
        extraction: Option<ExtractionMeta>,
        elapsed: Duration,
    },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            JobOutcome::Success { .. } => None,
            JobOutcome::Failure { error, .. } => Some(error.kind),
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            JobOutcome::Success { elapsed, .. } | JobOutcome::Failure { elapsed, .. } => *elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = JobState::Queued;
        for next in [
            JobState::Rasterizing,
            JobState::Extracting(ProviderRole::Primary),
            JobState::Extracting(ProviderRole::Fallback),
            JobState::Structuring,
            JobState::Persisting,
            JobState::Done(Verdict::Success),
        ] {
            state.advance(next).unwrap();
        }
        assert!(state.is_done());
    }

    #[test]
    fn test_transitions_never_go_backwards() {
        let mut state = JobState::Structuring;
        assert!(state.advance(JobState::Rasterizing).is_err());
        assert!(state.advance(JobState::Extracting(ProviderRole::Fallback)).is_err());
        assert_eq!(state, JobState::Structuring);
    }

    #[test]
    fn test_success_requires_persisting() {
        let mut state = JobState::Structuring;
        assert!(state.advance(JobState::Done(Verdict::Success)).is_err());
    }

    #[test]
    fn test_failure_from_any_live_state_then_terminal() {
        for start in [
            JobState::Queued,
            JobState::Rasterizing,
            JobState::Extracting(ProviderRole::Primary),
            JobState::Structuring,
            JobState::Persisting,
        ] {
            let mut state = start;
            state.advance(JobState::Done(Verdict::Failure)).unwrap();
            assert!(state.advance(JobState::Done(Verdict::Failure)).is_err());
            assert!(state.advance(JobState::Persisting).is_err());
        }
    }

    #[test]
    fn test_failure_stage_attribution() {
        assert_eq!(JobState::Queued.stage(), Stage::Rasterizing);
        assert_eq!(JobState::Extracting(ProviderRole::Fallback).stage(), Stage::Extracting);
        assert_eq!(JobState::Persisting.stage(), Stage::Persisting);
    }

    #[test]
    fn test_check_input() {
        let limits = LimitsConfig {
            max_file_size_bytes: 8,
            allowed_extensions: vec!["pdf".to_string()],
            ..LimitsConfig::default()
        };

        let letter = DocumentJob::new(0, "Letter.PDF", b"%PDF-1.7".to_vec());
        assert!(letter.check_input(&limits).is_ok());

        let err = DocumentJob::new(0, "notes.txt", b"%PDF".to_vec())
            .check_input(&limits)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        let err = DocumentJob::new(0, "big.pdf", vec![0u8; 9])
            .check_input(&limits)
            .unwrap_err();
        assert!(err.message.contains("too large"));

        let err = DocumentJob::new(0, " ", Vec::new()).check_input(&limits).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }
}
