//! Error types shared across the avatar crates

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Speech engine error: {0}")]
    SpeechEngine(#[from] SpeechEngineError),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Audio playback failures reported by an [`AudioPlayer`](crate::AudioPlayer)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("audio source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("failed to decode audio: {0}")]
    Decode(String),

    #[error("output device error: {0}")]
    Device(String),
}

/// Local speech engine failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpeechEngineError {
    #[error("speech engine unavailable")]
    Unavailable,

    #[error("utterance rejected: {0}")]
    Rejected(String),

    #[error("utterance never started after {attempts} attempts")]
    NeverStarted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Cloud speech provider failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudTtsError {
    #[error("cloud speech provider is not configured")]
    NotConfigured,

    #[error("cloud speech provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("cloud speech transport error: {0}")]
    Transport(String),

    #[error("cloud speech request timed out")]
    Timeout,
}

impl CloudTtsError {
    /// 4xx responses point at a request or credential problem, not an outage
    pub fn is_client_error(&self) -> bool {
        matches!(self, CloudTtsError::Status { status, .. } if (400..500).contains(status))
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudTtsError::Status { status, .. } => *status >= 500,
            CloudTtsError::Transport(_) | CloudTtsError::Timeout => true,
            CloudTtsError::NotConfigured => false,
        }
    }
}
