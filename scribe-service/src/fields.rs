//! Field extraction: turns OCR text into a structured record.
//!
//! Two language-model calls are made per document. The first asks for the
//! sender's identity and facility fields as a JSON object, the second for a
//! short summary. Transient provider failures and unparsable answers are
//! retried with exponential backoff; anything else fails immediately.

pub mod prompts;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{LlmConfig, MissingFieldPolicy, default_placeholder};
use crate::error::{FieldError, LlmError};
use crate::llm::{CompletionRequest, LanguageModel};

/// Summary used when the model keeps answering with near-empty text
pub const SUMMARY_FALLBACK: &str = "Letter content could not be summarized effectively.";

const MIN_SUMMARY_CHARS: usize = 10;
const EXTRACTION_MAX_TOKENS: u32 = 500;
const SUMMARY_MAX_TOKENS: u32 = 150;

/// Labels that precede an identifier on envelopes and letterheads
const DOC_NUMBER_LABELS: &[&str] = &["register number", "inmate", "cdcr", "idoc", "doc", "no."];

/// Final structured output for one document.
///
/// Optional fields serialize as `null` rather than being omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredRecord {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub date_created: String,
    pub doc_number: String,
    pub facility_name: String,
    pub address: String,
    pub unit: Option<String>,
    pub ai_summary: String,
    pub raw_text: String,
}

/// Identity and facility fields parsed from the extraction answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFields {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub doc_number: String,
    pub facility_name: String,
    pub address: String,
    pub unit: Option<String>,
}

pub struct FieldExtractor {
    model: Arc<dyn LanguageModel>,
    config: LlmConfig,
}

impl FieldExtractor {
    pub fn new(model: Arc<dyn LanguageModel>, mut config: LlmConfig) -> Self {
        // A blank placeholder would produce rows the store rejects
        if config.placeholder.trim().is_empty() {
            warn!(
                placeholder = %default_placeholder(),
                "Blank placeholder configured, using default"
            );
            config.placeholder = default_placeholder();
        }
        Self { model, config }
    }

    pub fn is_available(&self) -> bool {
        self.model.is_configured()
    }

    /// Produce a structured record from OCR text
    pub async fn structure(
        &self,
        raw_text: &str,
        filename: &str,
    ) -> Result<StructuredRecord, FieldError> {
        let fields = self.extract_fields(raw_text).await?;
        let ai_summary = self.summarize(raw_text).await?;

        info!(filename = %filename, doc_number = %fields.doc_number, "Structured record extracted");

        Ok(StructuredRecord {
            first_name: fields.first_name,
            middle_name: fields.middle_name,
            last_name: fields.last_name,
            date_created: chrono::Local::now().format("%Y-%m-%d").to_string(),
            doc_number: fields.doc_number,
            facility_name: fields.facility_name,
            address: fields.address,
            unit: fields.unit,
            ai_summary,
            raw_text: raw_text.to_string(),
        })
    }

    async fn extract_fields(&self, raw_text: &str) -> Result<ExtractedFields, FieldError> {
        let request = CompletionRequest {
            system: prompts::EXTRACTION_SYSTEM.to_string(),
            prompt: prompts::extraction_prompt(raw_text),
            temperature: self.config.extraction_temperature,
            max_tokens: EXTRACTION_MAX_TOKENS,
            json: true,
        };
        let max_attempts = self.max_attempts();

        for attempt in 1..=max_attempts {
            debug!(attempt, max_attempts, "Requesting field extraction");

            // A response that arrived but could not be decoded counts as unparsable
            let parsed = match self.model.complete(&request).await {
                Ok(answer) => {
                    parse_fields(&answer, self.config.missing_fields, &self.config.placeholder)
                }
                Err(LlmError::InvalidResponse { message }) => {
                    Err(format!("undecodable response: {}", message))
                }
                Err(e) => {
                    self.handle_llm_error(e, attempt).await?;
                    continue;
                }
            };

            match parsed {
                Ok(fields) => return Ok(fields),
                Err(message) if attempt < max_attempts => {
                    warn!(attempt, error = %message, "Extraction answer unusable, retrying");
                    tokio::time::sleep(self.backoff(attempt, None)).await;
                }
                Err(message) => {
                    return Err(FieldError::Parse {
                        attempts: attempt,
                        message,
                    });
                }
            }
        }

        Err(FieldError::Parse {
            attempts: max_attempts,
            message: "no attempts made".to_string(),
        })
    }

    async fn summarize(&self, raw_text: &str) -> Result<String, FieldError> {
        let request = CompletionRequest {
            system: prompts::SUMMARY_SYSTEM.to_string(),
            prompt: prompts::summary_prompt(raw_text),
            temperature: self.config.summary_temperature,
            max_tokens: SUMMARY_MAX_TOKENS,
            json: false,
        };
        let max_attempts = self.max_attempts();

        for attempt in 1..=max_attempts {
            match self.model.complete(&request).await {
                Ok(summary) if summary.trim().chars().count() >= MIN_SUMMARY_CHARS => {
                    return Ok(summary.trim().to_string());
                }
                Ok(_) => {
                    warn!(attempt, "Summary too short");
                }
                Err(LlmError::InvalidResponse { message }) => {
                    warn!(attempt, error = %message, "Summary response undecodable");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.backoff(attempt, None)).await;
                    }
                }
                Err(e) => self.handle_llm_error(e, attempt).await?,
            }
        }

        Ok(SUMMARY_FALLBACK.to_string())
    }

    /// Sleep before the next attempt when the error is worth retrying,
    /// otherwise turn it into the final failure.
    async fn handle_llm_error(&self, error: LlmError, attempt: u32) -> Result<(), FieldError> {
        if !error.is_transient() || attempt >= self.max_attempts() {
            warn!(attempt, error = %error, "Language model call failed");
            return Err(FieldError::Provider {
                attempts: attempt,
                source: error,
            });
        }

        let delay = self.backoff(attempt, Some(&error));
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient language model failure, retrying"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// Wait before the next attempt, never longer than `max_backoff_secs`
    fn backoff(&self, attempt: u32, error: Option<&LlmError>) -> Duration {
        let cap = Duration::from_secs(self.config.max_backoff_secs);
        if let Some(LlmError::RateLimited {
            retry_after_secs: Some(secs),
        }) = error
        {
            return Duration::from_secs(*secs).min(cap);
        }
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.backoff_base_ms.saturating_mul(1 << exponent)).min(cap)
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }
}

/// Parse the model's JSON answer, applying the missing-field policy.
///
/// Returns an error message when the answer is not a JSON object, or when
/// required fields are missing and the policy rejects such answers.
pub fn parse_fields(
    answer: &str,
    policy: MissingFieldPolicy,
    placeholder: &str,
) -> Result<ExtractedFields, String> {
    let value: Value =
        serde_json::from_str(strip_code_fence(answer)).map_err(|e| format!("invalid JSON: {}", e))?;
    let Value::Object(object) = value else {
        return Err("answer is not a JSON object".to_string());
    };

    let mut missing = Vec::new();
    let mut required = |key: &'static str, value: Option<String>| {
        value.unwrap_or_else(|| {
            missing.push(key);
            placeholder.to_string()
        })
    };

    let first_name = required("firstName", text_field(&object, "firstName", "first_name"));
    let last_name = required("lastName", text_field(&object, "lastName", "last_name"));
    let doc_number = required(
        "docNumber",
        text_field(&object, "docNumber", "doc_number")
            .map(|raw| clean_doc_number(&raw))
            .filter(|cleaned| !cleaned.is_empty()),
    );
    let facility_name = required(
        "facilityName",
        text_field(&object, "facilityName", "facility_name"),
    );
    let address = required("address", text_field(&object, "address", "address"));

    if !missing.is_empty() {
        match policy {
            MissingFieldPolicy::Reject => {
                return Err(format!("missing required fields: {}", missing.join(", ")));
            }
            MissingFieldPolicy::Placeholder => {
                warn!(
                    fields = ?missing,
                    placeholder = %placeholder,
                    "Required fields missing from answer"
                );
            }
        }
    }

    Ok(ExtractedFields {
        first_name,
        middle_name: text_field(&object, "middleName", "middle_name"),
        last_name,
        doc_number,
        facility_name,
        address,
        unit: text_field(&object, "unit", "unit"),
    })
}

/// A trimmed, non-empty text value; numbers are accepted as text
fn text_field(object: &Map<String, Value>, key: &str, snake: &str) -> Option<String> {
    let value = object.get(key).or_else(|| object.get(snake))?;
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let absent = text.is_empty()
        || text.eq_ignore_ascii_case("null")
        || text.eq_ignore_ascii_case("n/a");
    (!absent).then_some(text)
}

fn strip_code_fence(answer: &str) -> &str {
    let trimmed = answer.trim();
    match trimmed.strip_prefix("```") {
        Some(inner) => {
            let inner = inner.strip_prefix("json").unwrap_or(inner);
            inner.strip_suffix("```").unwrap_or(inner).trim()
        }
        None => trimmed,
    }
}

/// Remove identifier labels (`CDCR#:`, `IDOC #`, `Register Number`) left in front of the value
pub fn clean_doc_number(raw: &str) -> String {
    let mut rest = raw.trim();
    loop {
        let before = rest;
        for label in DOC_NUMBER_LABELS {
            if let Some(head) = rest.get(..label.len()) {
                if head.eq_ignore_ascii_case(label) {
                    rest = &rest[label.len()..];
                }
            }
        }
        rest = rest
            .trim_start_matches(|c: char| c == '#' || c == ':' || c == '.' || c.is_whitespace());
        if rest == before {
            break;
        }
    }
    rest.trim_end_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{FakeModel, GOOD_EXTRACTION, GOOD_SUMMARY};

    fn config() -> LlmConfig {
        LlmConfig {
            backoff_base_ms: 0,
            ..LlmConfig::default()
        }
    }

    fn extractor(model: Arc<FakeModel>) -> FieldExtractor {
        FieldExtractor::new(model, config())
    }

    #[tokio::test]
    async fn test_structure_combines_fields_and_summary() {
        let model = Arc::new(FakeModel::cooperative());
        let record = extractor(model.clone())
            .structure("--- PAGE 1 ---\nName: Ivan Sanchez", "letter.pdf")
            .await
            .unwrap();

        assert_eq!(record.first_name, "Ivan");
        assert_eq!(record.middle_name, None);
        assert_eq!(record.doc_number, "BK8702");
        assert_eq!(record.unit.as_deref(), Some("B4-217"));
        assert_eq!(record.ai_summary, GOOD_SUMMARY);
        assert_eq!(record.raw_text, "--- PAGE 1 ---\nName: Ivan Sanchez");
        assert_eq!(record.date_created.len(), 10);
        assert_eq!(model.extraction_calls(), 1);
        assert_eq!(model.summary_calls(), 1);
    }

    #[tokio::test]
    async fn test_unparsable_answer_retried_then_parse_error() {
        let model = Arc::new(FakeModel::new(|request, _| {
            Ok(if request.json {
                "Sorry, I cannot help with that.".to_string()
            } else {
                GOOD_SUMMARY.to_string()
            })
        }));
        let err = extractor(model.clone())
            .structure("text", "bad.pdf")
            .await
            .unwrap_err();

        assert!(matches!(err, FieldError::Parse { attempts: 3, .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::ExtractionParseError);
        assert_eq!(model.extraction_calls(), 3);
        assert_eq!(model.summary_calls(), 0);
    }

    #[tokio::test]
    async fn test_parse_error_recovers_on_retry() {
        let model = Arc::new(FakeModel::new(|request, index| {
            Ok(match (request.json, index) {
                (true, 0) => "{not json".to_string(),
                (true, _) => GOOD_EXTRACTION.to_string(),
                (false, _) => GOOD_SUMMARY.to_string(),
            })
        }));
        let record = extractor(model.clone()).structure("text", "a.pdf").await.unwrap();
        assert_eq!(record.last_name, "Sanchez");
        assert_eq!(model.extraction_calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let model = Arc::new(FakeModel::new(|request, index| match (request.json, index) {
            (true, 0) => Err(LlmError::Timeout { secs: 60 }),
            (true, 1) => Err(LlmError::Server {
                status: 503,
                message: "overloaded".to_string(),
            }),
            (true, _) => Ok(GOOD_EXTRACTION.to_string()),
            (false, _) => Ok(GOOD_SUMMARY.to_string()),
        }));
        extractor(model.clone()).structure("text", "a.pdf").await.unwrap();
        assert_eq!(model.extraction_calls(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let model = Arc::new(FakeModel::new(|_, _| {
            Err(LlmError::Unauthorized {
                status: 401,
                message: "bad key".to_string(),
            })
        }));
        let err = extractor(model.clone()).structure("text", "a.pdf").await.unwrap_err();

        assert!(matches!(err, FieldError::Provider { attempts: 1, .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::AiProviderError);
        assert_eq!(model.extraction_calls(), 1);
    }

    #[tokio::test]
    async fn test_short_summary_falls_back() {
        let model = Arc::new(FakeModel::new(|request, _| {
            Ok(if request.json {
                GOOD_EXTRACTION.to_string()
            } else {
                "Hi.".to_string()
            })
        }));
        let record = extractor(model.clone()).structure("", "blank.pdf").await.unwrap();
        assert_eq!(record.ai_summary, SUMMARY_FALLBACK);
        assert_eq!(model.summary_calls(), 3);
    }

    #[test]
    fn test_retry_after_is_capped() {
        let extractor = extractor(Arc::new(FakeModel::cooperative()));
        let hour = LlmError::RateLimited {
            retry_after_secs: Some(3600),
        };
        assert_eq!(extractor.backoff(1, Some(&hour)), Duration::from_secs(30));

        let short = LlmError::RateLimited {
            retry_after_secs: Some(2),
        };
        assert_eq!(extractor.backoff(1, Some(&short)), Duration::from_secs(2));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let extractor = FieldExtractor::new(
            Arc::new(FakeModel::cooperative()),
            LlmConfig {
                backoff_base_ms: 1000,
                max_backoff_secs: 5,
                ..LlmConfig::default()
            },
        );
        assert_eq!(extractor.backoff(1, None), Duration::from_secs(1));
        assert_eq!(extractor.backoff(3, None), Duration::from_secs(4));
        assert_eq!(extractor.backoff(10, None), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_long_retry_after_does_not_stall_job() {
        let model = Arc::new(FakeModel::new(|request, index| match (request.json, index) {
            (true, 0) => Err(LlmError::RateLimited {
                retry_after_secs: Some(3600),
            }),
            (true, _) => Ok(GOOD_EXTRACTION.to_string()),
            (false, _) => Ok(GOOD_SUMMARY.to_string()),
        }));
        let extractor = FieldExtractor::new(
            model.clone(),
            LlmConfig {
                max_backoff_secs: 0,
                ..config()
            },
        );

        let structured = extractor.structure("text", "a.pdf");
        let record = tokio::time::timeout(Duration::from_secs(5), structured)
            .await
            .expect("rate-limited job must not wait for the full Retry-After")
            .unwrap();
        assert_eq!(record.doc_number, "BK8702");
        assert_eq!(model.extraction_calls(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_response_is_retried() {
        let model = Arc::new(FakeModel::new(|request, index| match (request.json, index) {
            (true, 0) => Err(LlmError::InvalidResponse {
                message: "no choices in response".to_string(),
            }),
            (true, _) => Ok(GOOD_EXTRACTION.to_string()),
            (false, _) => Ok(GOOD_SUMMARY.to_string()),
        }));
        let record = extractor(model.clone()).structure("text", "a.pdf").await.unwrap();
        assert_eq!(record.first_name, "Ivan");
        assert_eq!(model.extraction_calls(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_responses_end_as_parse_error() {
        let model = Arc::new(FakeModel::new(|_, _| {
            Err(LlmError::InvalidResponse {
                message: "content is null".to_string(),
            })
        }));
        let err = extractor(model.clone()).structure("text", "a.pdf").await.unwrap_err();

        assert!(matches!(err, FieldError::Parse { attempts: 3, .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::ExtractionParseError);
        assert_eq!(model.extraction_calls(), 3);
    }

    #[tokio::test]
    async fn test_undecodable_summary_falls_back() {
        let model = Arc::new(FakeModel::new(|request, _| {
            if request.json {
                Ok(GOOD_EXTRACTION.to_string())
            } else {
                Err(LlmError::InvalidResponse {
                    message: "body is not JSON".to_string(),
                })
            }
        }));
        let record = extractor(model.clone()).structure("text", "a.pdf").await.unwrap();
        assert_eq!(record.ai_summary, SUMMARY_FALLBACK);
        assert_eq!(model.summary_calls(), 3);
    }

    #[tokio::test]
    async fn test_blank_placeholder_replaced_by_default() {
        let model = Arc::new(FakeModel::new(|request, _| {
            Ok(if request.json {
                r#"{"firstName": "Ivan", "lastName": "Sanchez"}"#.to_string()
            } else {
                GOOD_SUMMARY.to_string()
            })
        }));
        let extractor = FieldExtractor::new(
            model,
            LlmConfig {
                placeholder: String::new(),
                ..config()
            },
        );

        let record = extractor.structure("text", "a.pdf").await.unwrap();
        assert_eq!(record.doc_number, "Unknown");
        assert!(crate::store::validate(&record).is_ok());
    }

    #[test]
    fn test_missing_fields_get_placeholder() {
        let fields = parse_fields(
            r#"{"firstName": "Ivan", "lastName": "", "docNumber": null, "unit": ""}"#,
            MissingFieldPolicy::Placeholder,
            "Unknown",
        )
        .unwrap();
        assert_eq!(fields.first_name, "Ivan");
        assert_eq!(fields.last_name, "Unknown");
        assert_eq!(fields.doc_number, "Unknown");
        assert_eq!(fields.facility_name, "Unknown");
        assert_eq!(fields.unit, None);
    }

    #[test]
    fn test_missing_fields_rejected_by_policy() {
        let err = parse_fields(r#"{"firstName": "Ivan"}"#, MissingFieldPolicy::Reject, "Unknown")
            .unwrap_err();
        assert!(err.contains("lastName"));
        assert!(err.contains("address"));
    }

    #[test]
    fn test_fenced_answer_and_numeric_doc_number() {
        let fields = parse_fields(
            "```json\n{\"firstName\": \"Ana\", \"lastName\": \"Ruiz\", \"docNumber\": 101241, \"facilityName\": \"ISCI\", \"address\": \"PO Box 14\"}\n```",
            MissingFieldPolicy::Reject,
            "Unknown",
        )
        .unwrap();
        assert_eq!(fields.doc_number, "101241");
    }

    #[test]
    fn test_non_object_answer_is_unparsable() {
        assert!(parse_fields("[1, 2]", MissingFieldPolicy::Placeholder, "Unknown").is_err());
    }

    #[test]
    fn test_clean_doc_number_strips_labels() {
        assert_eq!(clean_doc_number("CDCR#: BK8702"), "BK8702");
        assert_eq!(clean_doc_number("IDOC #101241"), "101241");
        assert_eq!(clean_doc_number("Register Number 180738"), "180738");
        assert_eq!(clean_doc_number("A32203"), "A32203");
        assert_eq!(clean_doc_number("CDCR#:"), "");
    }
}
