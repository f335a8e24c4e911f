//! Test doubles for the speech collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use avatar_core::{
    AudioPlayer, AudioSource, CloudSpeechProvider, CloudTtsError, LocalSpeechEngine,
    PlaybackError, PlaybackOutcome, SpeechEngineError, StartCallback, Utterance, UtteranceEvent,
};

/// Plays every source for a fixed duration
pub(crate) struct MockPlayer {
    duration: Duration,
    played: Mutex<Vec<String>>,
    active: AtomicUsize,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    fail_next: AtomicBool,
    volume: Mutex<f32>,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockPlayer {
    pub(crate) fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            played: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            cancel: Mutex::new(None),
            fail_next: AtomicBool::new(false),
            volume: Mutex::new(1.0),
        })
    }

    pub(crate) fn played(&self) -> Vec<String> {
        self.played.lock().clone()
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub(crate) fn volume(&self) -> f32 {
        *self.volume.lock()
    }
}

#[async_trait]
impl AudioPlayer for MockPlayer {
    async fn play(
        &self,
        source: AudioSource,
        on_start: StartCallback,
    ) -> Result<PlaybackOutcome, PlaybackError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PlaybackError::Decode("corrupt clip".into()));
        }

        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.cancel.lock().replace(tx) {
            let _ = previous.send(());
        }
        self.played.lock().push(match &source {
            AudioSource::Uri(uri) => uri.clone(),
            AudioSource::Bytes { mime, .. } => format!("<bytes {mime}>"),
        });

        self.active.fetch_add(1, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);
        on_start();

        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(PlaybackOutcome::Finished),
            _ = rx => Ok(PlaybackOutcome::Cancelled),
        }
    }

    fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            let _ = cancel.send(());
        }
    }

    fn is_playing(&self) -> bool {
        self.active() > 0
    }

    fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume;
    }
}

/// Cloud provider that succeeds or fails with one status, optionally slowly
pub(crate) struct MockCloud {
    status: Mutex<Option<u16>>,
    delay: Mutex<Duration>,
    calls: AtomicU32,
    texts: Mutex<Vec<String>>,
}

impl MockCloud {
    pub(crate) fn succeeding() -> Arc<Self> {
        Self::with_status(None)
    }

    pub(crate) fn failing(status: u16) -> Arc<Self> {
        Self::with_status(Some(status))
    }

    fn with_status(status: Option<u16>) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(status),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicU32::new(0),
            texts: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }

    /// `None` switches the provider to success
    pub(crate) fn set_status(&self, status: Option<u16>) {
        *self.status.lock() = status;
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }
}

#[async_trait]
impl CloudSpeechProvider for MockCloud {
    fn is_configured(&self) -> bool {
        true
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CloudTtsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.lock().push(text.to_string());
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let status = *self.status.lock();
        match status {
            None => Ok(b"ID3audio".to_vec()),
            Some(status) => Err(CloudTtsError::Status {
                status,
                body: "mock failure".into(),
            }),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Local engine that starts at once and speaks for a fixed duration
pub(crate) struct MockLocal {
    duration: Duration,
    submits: AtomicU32,
    texts: Mutex<Vec<String>>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl MockLocal {
    pub(crate) fn speaking(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            submits: AtomicU32::new(0),
            texts: Mutex::new(Vec::new()),
            cancel: Mutex::new(None),
        })
    }

    pub(crate) fn submits(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }
}

impl LocalSpeechEngine for MockLocal {
    fn is_available(&self) -> bool {
        true
    }

    fn submit(
        &self,
        utterance: Utterance,
    ) -> Result<mpsc::UnboundedReceiver<UtteranceEvent>, SpeechEngineError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        self.texts.lock().push(utterance.text);

        let (events, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        if let Some(previous) = self.cancel.lock().replace(cancel_tx) {
            let _ = previous.send(());
        }

        let duration = self.duration;
        tokio::spawn(async move {
            let _ = events.send(UtteranceEvent::Started);
            let end = tokio::select! {
                _ = tokio::time::sleep(duration) => UtteranceEvent::Ended,
                _ = cancel_rx => UtteranceEvent::Interrupted,
            };
            let _ = events.send(end);
        });
        Ok(rx)
    }

    fn cancel(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            let _ = cancel.send(());
        }
    }
}
