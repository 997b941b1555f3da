//! Text extraction from page images.
//!
//! Providers are tried in order: the first one in the chain is the
//! primary, the rest are fallbacks. A provider-level failure (credentials,
//! network, quota, timeout) moves the whole page set to the next provider.
//! Page-level failures stay with the current provider and are recorded in
//! the text as an error marker for that page.

pub mod tesseract;
pub mod vision;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{OcrError, format_error_chain};
use crate::rasterize::PageImage;

pub use tesseract::TesseractProvider;
pub use vision::VisionProvider;

/// Results below this confidence are flagged as low confidence
pub const LOW_CONFIDENCE_THRESHOLD: f32 = 0.1;

/// Marker text for a page the provider could not read
const PAGE_ERROR_MARKER: &str = "[ERROR: Could not extract text]";

/// Position of the provider that produced a result
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderRole {
    Primary,
    Fallback,
}

/// Text recognized on a single page
#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub text: String,
    /// Provider confidence in [0, 1]
    pub confidence: f32,
}

/// An OCR capability
#[async_trait]
pub trait TextProvider: Send + Sync {
    /// Short identifier used in logs and results
    fn name(&self) -> &str;

    /// Upper bound for a single `recognize` call
    fn timeout(&self) -> Duration;

    /// Whether the provider looks usable right now
    async fn health_check(&self) -> bool;

    async fn recognize(&self, page: &PageImage) -> Result<PageText, OcrError>;
}

/// OCR output for one document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    /// Page texts in page order, each under a `--- PAGE n ---` header
    pub text: String,
    /// Mean page confidence in [0, 1]; 0 when no text was recognized
    pub confidence: f32,
    pub provider: ProviderRole,
    pub provider_name: String,
    pub page_count: usize,
    pub failed_pages: usize,
}

impl ExtractionResult {
    pub fn is_low_confidence(&self) -> bool {
        self.confidence < LOW_CONFIDENCE_THRESHOLD
    }
}

/// Ordered provider chain with fallback policy
pub struct TextExtractor {
    providers: Vec<Arc<dyn TextProvider>>,
}

impl TextExtractor {
    pub fn new(primary: Arc<dyn TextProvider>) -> Self {
        Self {
            providers: vec![primary],
        }
    }

    /// Append a provider tried after every earlier one failed
    pub fn with_fallback(mut self, fallback: Arc<dyn TextProvider>) -> Self {
        self.providers.push(fallback);
        self
    }

    pub fn has_fallback(&self) -> bool {
        self.providers.len() > 1
    }

    /// True when at least one provider reports healthy
    pub async fn health_check(&self) -> bool {
        for provider in &self.providers {
            if provider.health_check().await {
                return true;
            }
        }
        false
    }

    /// Recognize all pages, falling back to later providers on provider-level failure
    pub async fn extract(&self, pages: &[PageImage]) -> Result<ExtractionResult, OcrError> {
        let mut failures = Vec::new();

        for (position, provider) in self.providers.iter().enumerate() {
            let role = if position == 0 {
                ProviderRole::Primary
            } else {
                ProviderRole::Fallback
            };

            match run_provider(provider.as_ref(), role, pages).await {
                Ok(result) => {
                    info!(
                        provider = %provider.name(),
                        role = %role,
                        pages = result.page_count,
                        failed_pages = result.failed_pages,
                        confidence = result.confidence,
                        chars = result.text.len(),
                        "Text extraction complete"
                    );
                    return Ok(result);
                }
                Err(e) => {
                    warn!(
                        provider = %provider.name(),
                        role = %role,
                        error = %format_error_chain(&e),
                        "OCR provider failed"
                    );
                    failures.push(format!("{}: {}", provider.name(), format_error_chain(&e)));
                }
            }
        }

        Err(OcrError::Exhausted {
            summary: failures.join("; "),
        })
    }
}

async fn run_provider(
    provider: &dyn TextProvider,
    role: ProviderRole,
    pages: &[PageImage],
) -> Result<ExtractionResult, OcrError> {
    let mut page_texts = Vec::with_capacity(pages.len());

    for page in pages {
        debug!(
            provider = %provider.name(),
            page = page.index + 1,
            total = pages.len(),
            "Recognizing page"
        );

        let timeout = provider.timeout();
        match tokio::time::timeout(timeout, provider.recognize(page)).await {
            Err(_) => {
                return Err(OcrError::Timeout {
                    provider: provider.name().to_string(),
                    secs: timeout.as_secs(),
                });
            }
            Ok(Err(e)) if e.is_provider_level() => return Err(e),
            Ok(Err(e)) => {
                warn!(
                    provider = %provider.name(),
                    page = page.index + 1,
                    error = %e,
                    "Page recognition failed"
                );
                page_texts.push(None);
            }
            Ok(Ok(text)) => page_texts.push(Some(text)),
        }
    }

    Ok(assemble(provider.name(), role, &page_texts))
}

/// Join page texts in page order and derive the document confidence
fn assemble(
    provider_name: &str,
    role: ProviderRole,
    pages: &[Option<PageText>],
) -> ExtractionResult {
    let mut blocks = Vec::with_capacity(pages.len());
    let mut confidence_sum = 0.0;
    let mut failed_pages = 0;
    let mut recognized_any = false;

    for (index, page) in pages.iter().enumerate() {
        let number = index + 1;
        match page {
            Some(page) if !page.text.trim().is_empty() => {
                recognized_any = true;
                confidence_sum += page.confidence.clamp(0.0, 1.0);
                blocks.push(format!("--- PAGE {} ---\n{}", number, page.text.trim()));
            }
            Some(_) => {
                warn!(page = number, "No text found on page");
            }
            None => {
                failed_pages += 1;
                blocks.push(format!("--- PAGE {} ---\n{}", number, PAGE_ERROR_MARKER));
            }
        }
    }

    let confidence = if recognized_any && !pages.is_empty() {
        confidence_sum / pages.len() as f32
    } else {
        0.0
    };

    ExtractionResult {
        text: blocks.join("\n\n"),
        confidence,
        provider: role,
        provider_name: provider_name.to_string(),
        page_count: pages.len(),
        failed_pages,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn page_error() -> OcrError {
        OcrError::Page {
            page: 2,
            message: "unreadable".to_string(),
        }
    }

    fn quota_error() -> OcrError {
        OcrError::RateLimited {
            provider: "scripted".to_string(),
        }
    }

    #[tokio::test]
    async fn test_primary_success_is_marked_primary() {
        let primary = Arc::new(ScriptedProvider::always_text("vision", "Hello my name is Ivan"));
        let extractor = TextExtractor::new(primary.clone());

        let result = extractor.extract(&blank_pages(2)).await.unwrap();
        assert_eq!(result.provider, ProviderRole::Primary);
        assert_eq!(result.provider_name, "vision");
        assert_eq!(result.page_count, 2);
        assert_eq!(
            result.text,
            "--- PAGE 1 ---\nHello my name is Ivan\n\n--- PAGE 2 ---\nHello my name is Ivan"
        );
        assert!(!result.is_low_confidence());
        assert_eq!(primary.call_count(), 2);
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back() {
        let primary = Arc::new(ScriptedProvider::always_failing("vision"));
        let fallback = Arc::new(ScriptedProvider::always_text("tesseract", "fallback text"));
        let extractor = TextExtractor::new(primary).with_fallback(fallback.clone());

        let result = extractor.extract(&blank_pages(3)).await.unwrap();
        assert_eq!(result.provider, ProviderRole::Fallback);
        assert_eq!(result.provider_name, "tesseract");
        // the whole page set is retried on the fallback
        assert_eq!(fallback.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failure_without_fallback_is_unavailable() {
        let extractor = TextExtractor::new(Arc::new(ScriptedProvider::always_failing("vision")));
        let err = extractor.extract(&blank_pages(1)).await.unwrap_err();
        assert!(matches!(err, OcrError::Exhausted { .. }));
        assert!(err.to_string().contains("vision"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_provider_failure() {
        let primary = Arc::new(ScriptedProvider::new(
            "vision",
            vec![Script::Hang],
            Script::Text("", 0.0),
        ));
        let fallback = Arc::new(ScriptedProvider::always_text("tesseract", "slow but steady"));
        let extractor = TextExtractor::new(primary).with_fallback(fallback);

        let result = extractor.extract(&blank_pages(1)).await.unwrap();
        assert_eq!(result.provider, ProviderRole::Fallback);
        assert!(result.text.contains("slow but steady"));
    }

    #[tokio::test]
    async fn test_page_failure_is_marked_not_dropped() {
        let primary = Arc::new(ScriptedProvider::new(
            "vision",
            vec![
                Script::Text("first page", 0.8),
                Script::Fail(page_error),
                Script::Text("third page", 0.6),
            ],
            Script::Text("unused", 0.0),
        ));
        let fallback = Arc::new(ScriptedProvider::always_text("tesseract", "unused"));
        let extractor = TextExtractor::new(primary).with_fallback(fallback.clone());

        let result = extractor.extract(&blank_pages(3)).await.unwrap();
        assert_eq!(result.provider, ProviderRole::Primary);
        assert_eq!(result.failed_pages, 1);
        assert!(result.text.contains("--- PAGE 2 ---\n[ERROR: Could not extract text]"));
        assert!(result.text.contains("third page"));
        assert!((result.confidence - (0.8 + 0.6) / 3.0).abs() < 1e-6);
        assert_eq!(fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_text_is_low_confidence_not_failure() {
        let primary = Arc::new(ScriptedProvider::new(
            "vision",
            Vec::new(),
            Script::Text("   ", 0.95),
        ));
        let extractor = TextExtractor::new(primary);

        let result = extractor.extract(&blank_pages(2)).await.unwrap();
        assert_eq!(result.confidence, 0.0);
        assert!(result.is_low_confidence());
        assert!(result.text.is_empty());
    }

    #[tokio::test]
    async fn test_quota_midway_switches_provider() {
        let primary = Arc::new(ScriptedProvider::new(
            "vision",
            vec![Script::Text("page one", 0.9), Script::Fail(quota_error)],
            Script::Text("unused", 0.0),
        ));
        let fallback = Arc::new(ScriptedProvider::always_text("tesseract", "local text"));
        let extractor = TextExtractor::new(primary).with_fallback(fallback);

        let result = extractor.extract(&blank_pages(2)).await.unwrap();
        assert_eq!(result.provider, ProviderRole::Fallback);
        assert!(!result.text.contains("page one"));
    }
}
