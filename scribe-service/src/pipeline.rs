//! Batch orchestration.
//!
//! Jobs run one after another in submission order. For each job a progress
//! event is sent before work starts and a result event once it ends; a single
//! complete event closes the batch. A failing job never stops its siblings.

pub mod events;
pub mod job;

pub use events::{BatchSummary, FileResult, StreamEvent};
pub use job::{DocumentJob, ExtractionMeta, JobError, JobOutcome, JobState, Stage, Verdict};

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::LimitsConfig;
use crate::error::{ErrorKind, format_error_chain};
use crate::fields::{FieldExtractor, StructuredRecord};
use crate::ocr::{ProviderRole, TextExtractor};
use crate::rasterize::Rasterize;
use crate::store::CsvStore;

/// Events buffered between the orchestrator and the transport
const EVENT_BUFFER: usize = 32;

/// A stage failure plus whatever the job produced before it
struct StageFailure {
    error: JobError,
    record: Option<StructuredRecord>,
    extraction: Option<ExtractionMeta>,
}

impl From<JobError> for StageFailure {
    fn from(error: JobError) -> Self {
        Self {
            error,
            record: None,
            extraction: None,
        }
    }
}

/// Runs batches through rasterize, OCR, field extraction and persistence
pub struct BatchOrchestrator {
    rasterizer: Arc<dyn Rasterize>,
    extractor: Arc<TextExtractor>,
    fields: Arc<FieldExtractor>,
    store: CsvStore,
    limits: LimitsConfig,
}

impl BatchOrchestrator {
    pub fn new(
        rasterizer: Arc<dyn Rasterize>,
        extractor: Arc<TextExtractor>,
        fields: Arc<FieldExtractor>,
        store: CsvStore,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            rasterizer,
            extractor,
            fields,
            store,
            limits,
        }
    }

    /// Run a batch on its own task and return the event stream.
    ///
    /// Dropping the receiver lets the in-flight job finish; no further jobs start.
    pub fn spawn(self: &Arc<Self>, jobs: Vec<DocumentJob>) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let orchestrator = Arc::clone(self);
        let span = info_span!("batch", batch_id = %uuid::Uuid::new_v4(), files = jobs.len());
        tokio::spawn(
            async move {
                orchestrator.run(jobs, tx).await;
            }
            .instrument(span),
        );
        rx
    }

    /// Process `jobs` in index order, sending events to `events`.
    ///
    /// Returns the summary of the jobs that ran. When the receiver goes away
    /// the summary covers only the jobs processed up to that point.
    pub async fn run(
        &self,
        mut jobs: Vec<DocumentJob>,
        events: mpsc::Sender<StreamEvent>,
    ) -> BatchSummary {
        jobs.sort_by_key(|job| job.index);
        let total = jobs.len();
        let started = Instant::now();
        info!(total, "Batch started");

        let mut results = Vec::with_capacity(total);
        for (position, job) in jobs.iter().enumerate() {
            let current = position + 1;
            if events
                .send(StreamEvent::progress(current, total, job.filename.clone()))
                .await
                .is_err()
            {
                warn!(processed = position, total, "Event receiver gone, stopping batch");
                return BatchSummary::from_results(results);
            }

            let outcome = self.process_job(job).await;
            record_metrics(&outcome);

            let result = FileResult::from_outcome(&job.filename, &outcome);
            results.push(result.clone());
            if events.send(StreamEvent::Result { result }).await.is_err() {
                warn!(processed = current, total, "Event receiver gone, stopping batch");
                return BatchSummary::from_results(results);
            }
        }

        let summary = BatchSummary::from_results(results);
        info!(
            total = summary.total_files,
            processed = summary.processed,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch complete"
        );
        if events
            .send(StreamEvent::Complete {
                summary: summary.clone(),
            })
            .await
            .is_err()
        {
            warn!("Event receiver gone before batch summary");
        }
        summary
    }

    /// Run one job to its outcome. Never fails; errors become `Failure`.
    pub async fn process_job(&self, job: &DocumentJob) -> JobOutcome {
        let started = Instant::now();
        let mut state = JobState::Queued;

        let result = self
            .drive(job, &mut state)
            .instrument(info_span!("job", index = job.index, filename = %job.filename))
            .await;

        match result {
            Ok((record, extraction)) => {
                info!(
                    filename = %job.filename,
                    provider = %extraction.provider,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job succeeded"
                );
                JobOutcome::Success {
                    record,
                    extraction,
                    elapsed: started.elapsed(),
                }
            }
            Err(failure) => {
                enter(&mut state, JobState::Done(Verdict::Failure));
                warn!(
                    filename = %job.filename,
                    stage = %failure.error.stage,
                    kind = %failure.error.kind,
                    error = %failure.error,
                    "Job failed"
                );
                JobOutcome::Failure {
                    error: failure.error,
                    record: failure.record,
                    extraction: failure.extraction,
                    elapsed: started.elapsed(),
                }
            }
        }
    }

    async fn drive(
        &self,
        job: &DocumentJob,
        state: &mut JobState,
    ) -> Result<(StructuredRecord, ExtractionMeta), StageFailure> {
        enter(state, JobState::Rasterizing);
        job.check_input(&self.limits)?;
        let pages = self.rasterizer.rasterize(&job.bytes).await.map_err(|e| {
            JobError::new(e.kind(), state.stage(), format_error_chain(&e))
        })?;
        info!(pages = pages.len(), "Document rasterized");

        enter(state, JobState::Extracting(ProviderRole::Primary));
        let extraction = self.extractor.extract(&pages).await.map_err(|e| {
            JobError::new(
                ErrorKind::ExtractionUnavailable,
                state.stage(),
                format_error_chain(&e),
            )
        })?;
        drop(pages);
        if extraction.provider == ProviderRole::Fallback {
            enter(state, JobState::Extracting(ProviderRole::Fallback));
        }
        if extraction.is_low_confidence() {
            warn!(
                confidence = extraction.confidence,
                failed_pages = extraction.failed_pages,
                "Low-confidence extraction, structuring anyway"
            );
        }
        let meta = ExtractionMeta::from(&extraction);

        enter(state, JobState::Structuring);
        let record = match self.fields.structure(&extraction.text, &job.filename).await {
            Ok(record) => record,
            Err(e) => {
                return Err(StageFailure {
                    error: JobError::new(e.kind(), state.stage(), format_error_chain(&e)),
                    record: None,
                    extraction: Some(meta),
                });
            }
        };

        enter(state, JobState::Persisting);
        if let Err(e) = self.store.append(&record).await {
            return Err(StageFailure {
                error: JobError::new(
                    ErrorKind::PersistenceError,
                    state.stage(),
                    format_error_chain(&e),
                ),
                record: Some(record),
                extraction: Some(meta),
            });
        }

        enter(state, JobState::Done(Verdict::Success));
        Ok((record, meta))
    }
}

fn enter(state: &mut JobState, next: JobState) {
    if let Err(e) = state.advance(next) {
        error!(error = %e, "Job state machine violated");
    }
}

fn record_metrics(outcome: &JobOutcome) {
    let label = match outcome.error_kind() {
        None => "success".to_string(),
        Some(kind) => kind.to_string(),
    };
    metrics::counter!("scribe_jobs_total", "outcome" => label).increment(1);
    metrics::histogram!("scribe_job_duration_seconds").record(outcome.elapsed().as_secs_f64());
}
