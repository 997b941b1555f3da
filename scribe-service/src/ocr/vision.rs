//! Google Cloud Vision document text detection over REST.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VisionConfig;
use crate::error::{OcrError, ServiceError, ServiceResult};
use crate::rasterize::PageImage;

use super::{PageText, TextProvider};

const PROVIDER: &str = "google_vision";

/// gRPC status codes Vision reports inside a 200 response
const CODE_INVALID_ARGUMENT: i32 = 3;
const CODE_DEADLINE_EXCEEDED: i32 = 4;
const CODE_PERMISSION_DENIED: i32 = 7;
const CODE_RESOURCE_EXHAUSTED: i32 = 8;
const CODE_INTERNAL: i32 = 13;
const CODE_UNAVAILABLE: i32 = 14;
const CODE_UNAUTHENTICATED: i32 = 16;

/// Remote high-accuracy OCR provider
pub struct VisionProvider {
    client: Client,
    config: VisionConfig,
}

impl VisionProvider {
    pub fn new(config: VisionConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::Ocr(OcrError::Network {
                    provider: PROVIDER.to_string(),
                    source: e,
                })
            })?;

        Ok(Self { client, config })
    }

    fn transport_error(&self, e: reqwest::Error) -> OcrError {
        if e.is_timeout() {
            OcrError::Timeout {
                provider: PROVIDER.to_string(),
                secs: self.config.timeout_secs,
            }
        } else {
            OcrError::Network {
                provider: PROVIDER.to_string(),
                source: e,
            }
        }
    }
}

#[async_trait]
impl TextProvider for VisionProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn health_check(&self) -> bool {
        !self.config.api_key.trim().is_empty()
    }

    async fn recognize(&self, page: &PageImage) -> Result<PageText, OcrError> {
        if self.config.api_key.trim().is_empty() {
            return Err(OcrError::Auth {
                provider: PROVIDER.to_string(),
                message: "no API key configured".to_string(),
            });
        }

        let png = page.to_png().map_err(|e| OcrError::Page {
            page: page.index + 1,
            message: e.to_string(),
        })?;

        let request = AnnotateRequest {
            requests: vec![AnnotateImageRequest {
                image: ImageContent {
                    content: base64::engine::general_purpose::STANDARD.encode(&png),
                },
                features: vec![Feature {
                    kind: "DOCUMENT_TEXT_DETECTION",
                }],
            }],
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => OcrError::Auth {
                    provider: PROVIDER.to_string(),
                    message,
                },
                StatusCode::TOO_MANY_REQUESTS => OcrError::RateLimited {
                    provider: PROVIDER.to_string(),
                },
                _ => OcrError::Provider {
                    provider: PROVIDER.to_string(),
                    status: status.as_u16(),
                    message,
                },
            });
        }

        let body: AnnotateResponse = response
            .json()
            .await
            .map_err(|e| OcrError::InvalidResponse {
                provider: PROVIDER.to_string(),
                message: e.to_string(),
            })?;

        let annotation = body.responses.into_iter().next().unwrap_or_default();
        if let Some(error) = annotation.error {
            return Err(inline_error(error, page.index + 1));
        }

        let (text, confidence) = match annotation.full_text_annotation {
            Some(full) => {
                let confidences: Vec<f32> =
                    full.pages.iter().filter_map(|p| p.confidence).collect();
                let confidence = if confidences.is_empty() {
                    // Vision omits confidence on some responses; treat recognized text as trusted
                    if full.text.trim().is_empty() { 0.0 } else { 1.0 }
                } else {
                    confidences.iter().sum::<f32>() / confidences.len() as f32
                };
                (full.text.trim().to_string(), confidence)
            }
            None => (String::new(), 0.0),
        };

        debug!(page = page.index + 1, chars = text.len(), confidence, "Vision recognized page");

        Ok(PageText { text, confidence })
    }
}

/// Only a rejected image stays with this page; every other code is about the service
fn inline_error(error: RpcStatus, page: usize) -> OcrError {
    let provider = PROVIDER.to_string();
    match error.code {
        CODE_INVALID_ARGUMENT => OcrError::Page {
            page,
            message: error.message,
        },
        CODE_UNAUTHENTICATED | CODE_PERMISSION_DENIED => OcrError::Auth {
            provider,
            message: error.message,
        },
        CODE_RESOURCE_EXHAUSTED => OcrError::RateLimited { provider },
        CODE_DEADLINE_EXCEEDED | CODE_INTERNAL | CODE_UNAVAILABLE => OcrError::Unavailable {
            provider,
            message: format!("code {}: {}", error.code, error.message),
        },
        code => OcrError::Provider {
            provider,
            status: u16::try_from(code).unwrap_or_default(),
            message: error.message,
        },
    }
}

// Internal Vision API types

#[derive(Debug, Serialize)]
struct AnnotateRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Debug, Serialize)]
struct AnnotateImageRequest {
    image: ImageContent,
    features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    full_text_annotation: Option<FullTextAnnotation>,
    #[serde(default)]
    error: Option<RpcStatus>,
}

#[derive(Debug, Deserialize)]
struct FullTextAnnotation {
    #[serde(default)]
    text: String,
    #[serde(default)]
    pages: Vec<AnnotatedPage>,
}

#[derive(Debug, Deserialize)]
struct AnnotatedPage {
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}
