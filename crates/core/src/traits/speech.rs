//! Speech output traits

use crate::error::{CloudTtsError, PlaybackError, SpeechEngineError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which backend produced (or is producing) a piece of speech
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Pre-recorded catalog clip
    Catalog,
    /// Cloud text-to-speech
    Cloud,
    /// Local on-device text-to-speech
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Catalog => "catalog",
            BackendKind::Cloud => "cloud",
            BackendKind::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something an [`AudioPlayer`] can play
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// Reference to a stored clip (path or URL)
    Uri(String),
    /// Encoded audio held in memory
    Bytes { data: Arc<[u8]>, mime: String },
}

impl AudioSource {
    pub fn describe(&self) -> String {
        match self {
            AudioSource::Uri(uri) => uri.clone(),
            AudioSource::Bytes { data, mime } => format!("<{} bytes {}>", data.len(), mime),
        }
    }
}

/// Invoked once, when audio actually begins to sound
pub type StartCallback = Box<dyn FnOnce() + Send + 'static>;

/// How a playback ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Played to the end
    Finished,
    /// Stopped by `stop()` or replaced by another playback
    Cancelled,
}

/// Audio output device
///
/// At most one playback is active. Starting a new one cancels the previous
/// playback, which then resolves with [`PlaybackOutcome::Cancelled`].
///
/// # Example
///
/// ```ignore
/// let outcome = player
///     .play(AudioSource::Uri("./audio/intro_1.mp3".into()), Box::new(|| lipsync.start(&pauses)))
///     .await?;
/// ```
#[async_trait]
pub trait AudioPlayer: Send + Sync + 'static {
    /// Play a source to completion
    ///
    /// `on_start` fires when the first sample is audible, not when the call
    /// is made. It is not called when playback fails before starting.
    async fn play(
        &self,
        source: AudioSource,
        on_start: StartCallback,
    ) -> Result<PlaybackOutcome, PlaybackError>;

    /// Stop the active playback, if any
    fn stop(&self);

    fn is_playing(&self) -> bool;

    /// Output volume in `[0.0, 1.0]`
    fn set_volume(&self, volume: f32);

    /// Hint that these clips will be requested soon
    fn preload(&self, _uris: &[String]) {}
}

/// Remote text-to-speech service
#[async_trait]
pub trait CloudSpeechProvider: Send + Sync + 'static {
    /// True when credentials and a voice are present
    fn is_configured(&self) -> bool;

    /// Synthesize `text`, returning encoded audio
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CloudTtsError>;

    /// Mime type of the audio returned by `synthesize`
    fn mime_type(&self) -> &str {
        "audio/mpeg"
    }

    /// Provider name for logging
    fn name(&self) -> &str;
}

/// A request to the local speech engine
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    /// Preferred voice name, engine default when `None`
    pub voice: Option<String>,
    pub volume: f32,
    pub rate: f32,
}

impl Utterance {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
            volume: 1.0,
            rate: 1.0,
        }
    }
}

/// Lifecycle of a submitted utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtteranceEvent {
    Started,
    Ended,
    /// Cancelled by `cancel()` or by a newer utterance
    Interrupted,
    Failed(String),
}

/// On-device speech engine
///
/// Engines are known to accept an utterance and silently never start it.
/// Callers are expected to watch for [`UtteranceEvent::Started`] with a
/// deadline and resubmit.
pub trait LocalSpeechEngine: Send + Sync + 'static {
    /// Checked at call time; availability can change at runtime
    fn is_available(&self) -> bool;

    /// Queue an utterance and return its lifecycle events
    fn submit(
        &self,
        utterance: Utterance,
    ) -> Result<mpsc::UnboundedReceiver<UtteranceEvent>, SpeechEngineError>;

    /// Cancel everything queued or speaking
    fn cancel(&self);
}
