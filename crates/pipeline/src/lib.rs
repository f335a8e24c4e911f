//! Speech pipeline for the avatar
//!
//! Features:
//! - Retry with jittered backoff and a circuit breaker around the cloud
//! - Cloud (HTTP) and local text-to-speech
//! - Procedural lip-sync and karaoke subtitles
//! - Speech orchestrator choosing clip, cloud or local speech per request

pub mod lipsync;
pub mod orchestrator;
pub mod resilience;
pub mod script;
pub mod subtitles;
pub mod tts;

#[cfg(test)]
mod testing;

pub use lipsync::{LipSyncDriver, LipSyncSettings};
pub use orchestrator::{
    OrchestratorBuilder, OrchestratorConfig, SpeakOutcome, SpeakRequest, SpeechOrchestrator,
};
pub use resilience::{
    with_retry, BreakerError, BreakerPolicy, BreakerStats, CircuitBreaker, CircuitState,
    RetryPolicy,
};
pub use script::SpeechScript;
pub use subtitles::SubtitleDriver;
pub use tts::{HttpCloudTts, LocalOutcome, LocalSpeaker, NudgePolicy};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid pipeline configuration: {0}")]
    Config(String),

    #[error("Cloud speech error: {0}")]
    Cloud(#[from] avatar_core::CloudTtsError),
}

impl From<PipelineError> for avatar_core::Error {
    fn from(err: PipelineError) -> Self {
        avatar_core::Error::Config(err.to_string())
    }
}
