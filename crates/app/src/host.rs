//! Headless host adapters
//!
//! The binary runs without an audio device or a platform speech engine.
//! [`HeadlessPlayer`] holds each clip for as long as it would play and
//! [`ConsoleSpeechEngine`] logs utterances at reading speed. Both honor
//! cancellation, so the orchestrator behaves exactly as it would against
//! real hardware.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use avatar_core::{
    AudioPlayer, AudioSource, LocalSpeechEngine, PlaybackError, PlaybackOutcome,
    SpeechEngineError, StartCallback, Utterance, UtteranceEvent,
};

/// 128 kbps MP3
const DEFAULT_BYTES_PER_MS: u64 = 16;

#[derive(Default)]
struct Active {
    generation: u64,
    cancel: Option<oneshot::Sender<()>>,
}

/// Silent player that paces playback by encoded size
pub struct HeadlessPlayer {
    bytes_per_ms: u64,
    volume: Mutex<f32>,
    active: Mutex<Active>,
    playing: AtomicBool,
}

impl Default for HeadlessPlayer {
    fn default() -> Self {
        Self::new(DEFAULT_BYTES_PER_MS)
    }
}

impl HeadlessPlayer {
    pub fn new(bytes_per_ms: u64) -> Self {
        Self {
            bytes_per_ms: bytes_per_ms.max(1),
            volume: Mutex::new(1.0),
            active: Mutex::new(Active::default()),
            playing: AtomicBool::new(false),
        }
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock()
    }

    async fn duration_of(&self, source: &AudioSource) -> Result<Duration, PlaybackError> {
        let size = match source {
            AudioSource::Uri(uri) => tokio::fs::metadata(uri)
                .await
                .map_err(|e| PlaybackError::SourceUnavailable(format!("{uri}: {e}")))?
                .len(),
            AudioSource::Bytes { data, .. } => data.len() as u64,
        };
        if size == 0 {
            return Err(PlaybackError::Decode("empty audio".to_string()));
        }
        Ok(Duration::from_millis(size / self.bytes_per_ms))
    }
}

#[async_trait]
impl AudioPlayer for HeadlessPlayer {
    async fn play(
        &self,
        source: AudioSource,
        on_start: StartCallback,
    ) -> Result<PlaybackOutcome, PlaybackError> {
        let duration = self.duration_of(&source).await?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let generation = {
            let mut active = self.active.lock();
            if let Some(previous) = active.cancel.replace(cancel_tx) {
                let _ = previous.send(());
            }
            active.generation += 1;
            active.generation
        };
        self.playing.store(true, Ordering::Release);

        tracing::debug!(
            source = %source.describe(),
            duration_ms = duration.as_millis() as u64,
            volume = self.volume(),
            "Playback started"
        );
        on_start();

        let outcome = tokio::select! {
            _ = tokio::time::sleep(duration) => PlaybackOutcome::Finished,
            _ = cancel_rx => PlaybackOutcome::Cancelled,
        };

        let mut active = self.active.lock();
        if active.generation == generation {
            active.cancel = None;
            self.playing.store(false, Ordering::Release);
        }
        Ok(outcome)
    }

    fn stop(&self) {
        if let Some(cancel) = self.active.lock().cancel.take() {
            let _ = cancel.send(());
        }
        self.playing.store(false, Ordering::Release);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume.clamp(0.0, 1.0);
    }

    fn preload(&self, uris: &[String]) {
        let missing: Vec<&String> = uris
            .iter()
            .filter(|uri| !std::path::Path::new(uri.as_str()).exists())
            .collect();
        if missing.is_empty() {
            tracing::debug!(clips = uris.len(), "Catalog audio present");
        } else {
            tracing::warn!(missing = ?missing, "Catalog audio files not found");
        }
    }
}

/// Speech engine that writes utterances to the log at reading speed
pub struct ConsoleSpeechEngine {
    ms_per_char: u64,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl ConsoleSpeechEngine {
    pub fn new(ms_per_char: u64) -> Self {
        Self {
            ms_per_char: ms_per_char.max(1),
            cancel: Mutex::new(None),
        }
    }

    fn speaking_time(&self, utterance: &Utterance) -> Duration {
        let chars = utterance.text.chars().count() as f64;
        let rate = if utterance.rate > 0.0 {
            utterance.rate as f64
        } else {
            1.0
        };
        Duration::from_millis((chars * self.ms_per_char as f64 / rate) as u64)
    }
}

impl LocalSpeechEngine for ConsoleSpeechEngine {
    fn is_available(&self) -> bool {
        tokio::runtime::Handle::try_current().is_ok()
    }

    fn submit(
        &self,
        utterance: Utterance,
    ) -> Result<mpsc::UnboundedReceiver<UtteranceEvent>, SpeechEngineError> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| SpeechEngineError::Unavailable)?;
        if utterance.text.trim().is_empty() {
            return Err(SpeechEngineError::Rejected("empty utterance".to_string()));
        }

        let (events, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        if let Some(previous) = self.cancel.lock().replace(cancel_tx) {
            let _ = previous.send(());
        }

        let duration = self.speaking_time(&utterance);
        handle.spawn(async move {
            tracing::info!(
                text = %utterance.text,
                voice = utterance.voice.as_deref().unwrap_or("default"),
                "Avatar says"
            );
            let _ = events.send(UtteranceEvent::Started);
            let last = tokio::select! {
                _ = tokio::time::sleep(duration) => UtteranceEvent::Ended,
                _ = cancel_rx => UtteranceEvent::Interrupted,
            };
            let _ = events.send(last);
        });
        Ok(rx)
    }

    fn cancel(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            let _ = cancel.send(());
        }
    }
}
