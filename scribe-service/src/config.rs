//! Service configuration.
//!
//! Settings come from an optional `config.{toml,yaml,json}` file and are
//! overridden by `SCRIBE__`-prefixed environment variables.

mod loader;
mod static_config;

pub use loader::{load_settings, load_settings_from};
pub use static_config::{
    LimitsConfig, LlmConfig, LoggingConfig, MissingFieldPolicy, OcrConfig, RasterConfig,
    ServerConfig, Settings, StorageConfig, TesseractConfig, VisionConfig,
};
pub(crate) use static_config::default_placeholder;
