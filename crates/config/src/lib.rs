//! Configuration management for the avatar speech core
//!
//! Supports loading configuration from:
//! - TOML/YAML/JSON files (`config/default`, `config/{env}`)
//! - Environment variables (`AVATAR__` prefix, `__` between sections)
//!
//! Also owns the clip catalog loader: external catalog documents are
//! validated here and rejected as a whole on any error, falling back to the
//! built-in catalog.

pub mod catalog;
pub mod settings;

pub use catalog::{
    builtin_catalog, is_valid_catalog_id, load_catalog, parse_catalog, parse_overrides,
    CatalogError,
};
pub use settings::{
    load_settings, load_settings_from, BreakerConfig, CatalogConfig, CloudTtsConfig,
    ConnectionConfig, LipSyncConfig, ObservabilityConfig, PreferredProvider, PresentationConfig,
    RetryConfig, RuntimeEnvironment, Settings, SpeechConfig, SubtitleConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Environment error: {0}")]
    Environment(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl From<ConfigError> for avatar_core::Error {
    fn from(err: ConfigError) -> Self {
        avatar_core::Error::Config(err.to_string())
    }
}
