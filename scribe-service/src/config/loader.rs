//! Configuration loading from files and environment variables.

use ::config::{Config, Environment, File};

use crate::error::{ServiceError, ServiceResult};

use super::static_config::Settings;

/// Environment variable prefix, e.g. `SCRIBE__SERVER__PORT=9000`
const ENV_PREFIX: &str = "SCRIBE";

/// Load settings from an optional `config.*` file and `SCRIBE__*` env vars
pub fn load_settings() -> ServiceResult<Settings> {
    load_settings_from("config")
}

/// Load settings using `file_stem` as the optional config file
pub fn load_settings_from(file_stem: &str) -> ServiceResult<Settings> {
    Config::builder()
        .add_source(File::with_name(file_stem).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.cors_origins")
                .with_list_parse_key("limits.allowed_extensions")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to build config: {}", e),
        })?
        .try_deserialize()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to deserialize config: {}", e),
        })
}
