//! Caller side of the event stream.
//!
//! Bytes arrive in arbitrary chunks; they are buffered until a full line is
//! available and only then parsed. A batch is finished only when its
//! `complete` event has been seen.

use futures::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use tracing::{debug, info};

use crate::error::ClientError;
use crate::pipeline::{BatchSummary, FileResult, StreamEvent};

/// Splits a byte stream into newline-delimited events
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Feed a chunk and return every event completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, ClientError> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(event) = parse_line(&line)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Parse whatever is left once the stream ends
    pub fn finish(self) -> Result<Option<StreamEvent>, ClientError> {
        parse_line(&self.buffer)
    }
}

fn parse_line(raw: &[u8]) -> Result<Option<StreamEvent>, ClientError> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|source| ClientError::Malformed {
            line: line.chars().take(200).collect(),
            source,
        })
}

/// Live state of a batch as seen by the caller
#[derive(Debug, Clone, Default)]
pub struct BatchProgress {
    pub total: Option<usize>,
    /// 1-based index of the job being worked on
    pub current: usize,
    pub percentage: u8,
    pub current_file: Option<String>,
    pub results: Vec<FileResult>,
    pub summary: Option<BatchSummary>,
}

impl BatchProgress {
    /// Fold one event into the state, rejecting out-of-order streams
    pub fn apply(&mut self, event: &StreamEvent) -> Result<(), ClientError> {
        if self.summary.is_some() {
            return Err(violation("event received after complete"));
        }

        match event {
            StreamEvent::Progress {
                current,
                total,
                filename,
                percentage,
            } => {
                if *current < self.current {
                    return Err(violation(format!(
                        "progress went backwards ({} after {})",
                        current, self.current
                    )));
                }
                if self.total.is_some_and(|known| known != *total) {
                    return Err(violation("batch size changed mid-stream"));
                }
                self.total = Some(*total);
                self.current = *current;
                self.percentage = *percentage;
                self.current_file = Some(filename.clone());
            }
            StreamEvent::Result { result } => {
                self.results.push(result.clone());
            }
            StreamEvent::Complete { summary } => {
                if summary.results.len() != summary.total_files
                    || summary.processed + summary.failed != summary.total_files
                {
                    return Err(violation("summary counts do not add up"));
                }
                if summary.total_files != self.results.len() {
                    return Err(violation(format!(
                        "summary covers {} files but {} results were streamed",
                        summary.total_files,
                        self.results.len()
                    )));
                }
                self.percentage = 100;
                self.current_file = None;
                self.summary = Some(summary.clone());
            }
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.summary.is_some()
    }

    pub fn into_summary(self) -> Result<BatchSummary, ClientError> {
        self.summary.ok_or(ClientError::IncompleteStream)
    }
}

fn violation(message: impl Into<String>) -> ClientError {
    ClientError::ProtocolViolation {
        message: message.into(),
    }
}

/// Drain a byte stream, calling `on_event` for each event, and return the summary
pub async fn consume<S, B, E>(
    stream: S,
    mut on_event: impl FnMut(&StreamEvent, &BatchProgress),
) -> Result<BatchSummary, ClientError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = LineDecoder::default();
    let mut progress = BatchProgress::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ClientError::Transport {
            message: e.to_string(),
        })?;
        for event in decoder.push(chunk.as_ref())? {
            progress.apply(&event)?;
            on_event(&event, &progress);
        }
    }

    if let Some(event) = decoder.finish()? {
        progress.apply(&event)?;
        on_event(&event, &progress);
    }

    progress.into_summary()
}

/// Upload `files` as one batch to `<base_url>/api/process` and follow the stream
pub async fn submit(
    base_url: &str,
    files: Vec<(String, Vec<u8>)>,
    on_event: impl FnMut(&StreamEvent, &BatchProgress),
) -> Result<BatchSummary, ClientError> {
    let url = format!("{}/api/process", base_url.trim_end_matches('/'));
    let http = |source| ClientError::Http {
        url: url.clone(),
        source,
    };

    let mut form = Form::new();
    for (filename, bytes) in files {
        let part = Part::bytes(bytes)
            .file_name(filename)
            .mime_str("application/pdf")
            .map_err(http)?;
        form = form.part("files", part);
    }

    let response = reqwest::Client::new()
        .post(&url)
        .multipart(form)
        .send()
        .await
        .map_err(http)?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            message,
        });
    }
    debug!(url = %url, "Batch accepted, reading stream");

    let summary = consume(response.bytes_stream(), on_event).await?;
    info!(
        total = summary.total_files,
        processed = summary.processed,
        failed = summary.failed,
        "Batch finished"
    );
    Ok(summary)
}
