//! Runtime wiring for the avatar speech core
//!
//! Ties the connection manager, state store and speech orchestrator to one
//! event bus, and provides headless host adapters plus Prometheus metrics for
//! the `avatar` binary.

pub mod host;
pub mod runtime;
pub mod telemetry;

pub use host::{ConsoleSpeechEngine, HeadlessPlayer};
pub use runtime::{AvatarRuntime, Collaborators};
pub use telemetry::{init_metrics, register_default_metrics, MetricsBridge};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] avatar_config::ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] avatar_pipeline::PipelineError),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
