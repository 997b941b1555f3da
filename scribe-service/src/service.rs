//! Service coordinator: builds every pipeline component from settings.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{OcrConfig, Settings};
use crate::error::ServiceResult;
use crate::fields::FieldExtractor;
use crate::llm::OpenAiClient;
use crate::ocr::{TesseractProvider, TextExtractor, TextProvider, VisionProvider};
use crate::pipeline::{BatchOrchestrator, DocumentJob, StreamEvent};
use crate::rasterize::{PdfRasterizer, Rasterize};
use crate::store::CsvStore;

/// Capability availability reported by the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub ocr: bool,
    pub ai: bool,
}

impl Availability {
    pub fn is_healthy(&self) -> bool {
        self.ocr && self.ai
    }
}

/// Main service coordinator
pub struct ScribeService {
    pub settings: Settings,
    pub store: CsvStore,
    orchestrator: Arc<BatchOrchestrator>,
    extractor: Arc<TextExtractor>,
    fields: Arc<FieldExtractor>,
}

impl ScribeService {
    /// Create a service with the configured providers
    pub fn new(settings: Settings) -> ServiceResult<Self> {
        info!("Initializing Scribe service");

        let rasterizer: Arc<dyn Rasterize> = Arc::new(PdfRasterizer::new(settings.raster.clone()));
        let extractor = Arc::new(build_text_extractor(&settings.ocr)?);

        let model = Arc::new(OpenAiClient::new(settings.llm.clone())?);
        info!(model = %model.model(), url = %settings.llm.base_url, "Language model client ready");
        let fields = Arc::new(FieldExtractor::new(model, settings.llm.clone()));

        let store = CsvStore::new(&settings.storage.csv_path);
        info!(path = %store.path().display(), "Record store ready");

        Ok(Self::from_parts(settings, rasterizer, extractor, fields, store))
    }

    /// Assemble a service from already-built components
    pub fn from_parts(
        settings: Settings,
        rasterizer: Arc<dyn Rasterize>,
        extractor: Arc<TextExtractor>,
        fields: Arc<FieldExtractor>,
        store: CsvStore,
    ) -> Self {
        let orchestrator = Arc::new(BatchOrchestrator::new(
            rasterizer,
            extractor.clone(),
            fields.clone(),
            store.clone(),
            settings.limits.clone(),
        ));
        Self {
            settings,
            store,
            orchestrator,
            extractor,
            fields,
        }
    }

    /// Start a batch; events arrive on the returned receiver
    pub fn process_batch(&self, jobs: Vec<DocumentJob>) -> mpsc::Receiver<StreamEvent> {
        self.orchestrator.spawn(jobs)
    }

    pub async fn availability(&self) -> Availability {
        Availability {
            ocr: self.extractor.health_check().await,
            ai: self.fields.is_available(),
        }
    }
}

/// Vision first with Tesseract behind it when a key is set, Tesseract alone otherwise
fn build_text_extractor(config: &OcrConfig) -> ServiceResult<TextExtractor> {
    let has_vision_key = !config.primary.api_key.trim().is_empty();

    let tesseract = config.fallback.enabled.then(|| {
        Arc::new(TesseractProvider::new(config.fallback.clone())) as Arc<dyn TextProvider>
    });

    let extractor = match (has_vision_key, tesseract) {
        (true, Some(tesseract)) => {
            info!("OCR: Google Vision with Tesseract fallback");
            TextExtractor::new(Arc::new(VisionProvider::new(config.primary.clone())?))
                .with_fallback(tesseract)
        }
        (true, None) => {
            info!("OCR: Google Vision without fallback");
            TextExtractor::new(Arc::new(VisionProvider::new(config.primary.clone())?))
        }
        (false, Some(tesseract)) => {
            info!("OCR: Tesseract only (no Vision API key)");
            TextExtractor::new(tesseract)
        }
        (false, None) => {
            warn!(
                "OCR: no Vision API key and Tesseract disabled; every document will fail extraction"
            );
            TextExtractor::new(Arc::new(VisionProvider::new(config.primary.clone())?))
        }
    };
    Ok(extractor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TesseractConfig, VisionConfig};

    #[test]
    fn test_vision_key_enables_fallback_chain() {
        let config = OcrConfig {
            primary: VisionConfig {
                api_key: "key".to_string(),
                ..VisionConfig::default()
            },
            fallback: TesseractConfig::default(),
        };
        assert!(build_text_extractor(&config).unwrap().has_fallback());
    }

    #[test]
    fn test_without_vision_key_tesseract_is_primary() {
        let config = OcrConfig {
            primary: VisionConfig::default(),
            fallback: TesseractConfig::default(),
        };
        assert!(!build_text_extractor(&config).unwrap().has_fallback());
    }
}
