//! Typed settings read once at startup.
//! Every field has a default so an empty environment yields a runnable service.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub raster: RasterConfig,

    #[serde(default)]
    pub ocr: OcrConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Origins allowed by CORS. `*` allows any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

/// Per-file upload limits
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Lowercase extensions without the dot
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Cap on a whole upload request
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,
}

/// Page rendering and enhancement
#[derive(Debug, Clone, Deserialize)]
pub struct RasterConfig {
    #[serde(default = "default_dpi")]
    pub dpi: u32,

    #[serde(default = "default_contrast")]
    pub contrast: f32,

    #[serde(default = "default_sharpness")]
    pub sharpness: f32,

    #[serde(default = "default_brightness")]
    pub brightness: f32,

    /// Directory holding libpdfium. Falls back to ./, vendor/pdfium/lib/ and system paths.
    #[serde(default)]
    pub pdfium_path: Option<PathBuf>,
}

/// OCR providers
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OcrConfig {
    #[serde(default)]
    pub primary: VisionConfig,

    #[serde(default)]
    pub fallback: TesseractConfig,
}

/// Google Cloud Vision (remote, high accuracy)
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    /// API key. Empty disables the remote provider.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_vision_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_vision_timeout_secs")]
    pub timeout_secs: u64,
}

/// Local Tesseract binary (lower accuracy)
#[derive(Debug, Clone, Deserialize)]
pub struct TesseractConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tesseract_binary")]
    pub binary: String,

    /// Page segmentation mode
    #[serde(default = "default_psm")]
    pub psm: u8,

    /// OCR engine mode
    #[serde(default = "default_oem")]
    pub oem: u8,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_tesseract_timeout_secs")]
    pub timeout_secs: u64,
}

/// OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_extraction_temperature")]
    pub extraction_temperature: f32,

    #[serde(default = "default_summary_temperature")]
    pub summary_temperature: f32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Total attempts per call, first try included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for any single wait between attempts, Retry-After included
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    #[serde(default)]
    pub missing_fields: MissingFieldPolicy,

    /// Value written into required fields the model left empty; must not be blank
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
}

/// What to do when the model answers with valid JSON that lacks required fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFieldPolicy {
    /// Fill the gaps with the configured placeholder
    #[default]
    Placeholder,
    /// Treat the answer as unparsable
    Reject,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_csv_path")]
    pub csv_path: PathBuf,
}

/// Logging output
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of the compact human format
    #[serde(default)]
    pub json: bool,
}

impl Settings {
    /// Non-fatal configuration problems, logged at startup
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.llm.api_key.trim().is_empty() {
            warnings.push("Language model API key not configured (AI extraction will fail)".into());
        }
        if self.ocr.primary.api_key.trim().is_empty() {
            warnings.push(
                "Vision API key not configured (only the local OCR provider is used)".into(),
            );
        }
        if self.llm.placeholder.trim().is_empty() {
            warnings.push(format!(
                "llm.placeholder is blank (rows with missing fields would be rejected), using \"{}\"",
                default_placeholder()
            ));
        }
        if self.limits.max_file_size_bytes < 1024 * 1024 {
            warnings.push(format!(
                "max_file_size_bytes too small: {} bytes",
                self.limits.max_file_size_bytes
            ));
        }
        if let Some(parent) = self.storage.csv_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                warnings.push(format!(
                    "Storage directory does not exist yet: {}",
                    parent.display()
                ));
            }
        }

        warnings
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size(),
            allowed_extensions: default_allowed_extensions(),
            max_batch_bytes: default_max_batch_bytes(),
        }
    }
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            dpi: default_dpi(),
            contrast: default_contrast(),
            sharpness: default_sharpness(),
            brightness: default_brightness(),
            pdfium_path: None,
        }
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: default_vision_endpoint(),
            timeout_secs: default_vision_timeout_secs(),
        }
    }
}

impl Default for TesseractConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_tesseract_binary(),
            psm: default_psm(),
            oem: default_oem(),
            language: default_language(),
            timeout_secs: default_tesseract_timeout_secs(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_url(),
            api_key: String::new(),
            model: default_model(),
            extraction_temperature: default_extraction_temperature(),
            summary_temperature: default_summary_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            missing_fields: MissingFieldPolicy::default(),
            placeholder: default_placeholder(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            csv_path: default_csv_path(),
        }
    }
}

// ==================== Default Value Functions ====================

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:5173".to_string()]
}

fn default_max_file_size() -> u64 {
    10_485_760 // 10MB
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["pdf".to_string()]
}

fn default_max_batch_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_dpi() -> u32 {
    300
}

fn default_contrast() -> f32 {
    2.0
}

fn default_sharpness() -> f32 {
    1.5
}

fn default_brightness() -> f32 {
    1.1
}

fn default_vision_endpoint() -> String {
    "https://vision.googleapis.com/v1/images:annotate".to_string()
}

fn default_vision_timeout_secs() -> u64 {
    60
}

fn default_tesseract_binary() -> String {
    "tesseract".to_string()
}

fn default_psm() -> u8 {
    6
}

fn default_oem() -> u8 {
    3
}

fn default_language() -> String {
    "eng".to_string()
}

fn default_tesseract_timeout_secs() -> u64 {
    120
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_extraction_temperature() -> f32 {
    0.1
}

fn default_summary_temperature() -> f32 {
    0.3
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_max_backoff_secs() -> u64 {
    30
}

pub(crate) fn default_placeholder() -> String {
    "Unknown".to_string()
}

fn default_csv_path() -> PathBuf {
    PathBuf::from("./data/extracted.csv")
}
