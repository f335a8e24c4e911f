//! Test doubles for runtime integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use avatar_core::{
    AudioPlayer, AudioSource, CloudSpeechProvider, CloudTtsError, LocalSpeechEngine,
    PlaybackError, PlaybackOutcome, SpeechEngineError, StartCallback, Utterance, UtteranceEvent,
};
use avatar_transport::{Connection, Connector, TransportError, TransportEvent};

/// Remote end of an accepted connection
pub struct Peer {
    pub to_client: mpsc::Sender<TransportEvent>,
    pub from_client: mpsc::Receiver<String>,
}

impl Peer {
    pub async fn send(&self, frame: &str) {
        self.to_client
            .send(TransportEvent::Text(frame.to_string()))
            .await
            .unwrap();
    }

    pub async fn close(&self, code: u16) {
        self.to_client
            .send(TransportEvent::Closed { code })
            .await
            .unwrap();
    }
}

/// Accepts every connection and hands the peer side to the test
#[derive(Default)]
pub struct LoopbackConnector {
    opens: AtomicUsize,
    peers: Mutex<Vec<Peer>>,
}

impl LoopbackConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn take_peer(&self) -> Peer {
        self.peers.lock().remove(0)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self, _endpoint: &str) -> Result<Connection, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        self.peers.lock().push(Peer {
            to_client: in_tx,
            from_client: out_rx,
        });
        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Plays every source for a fixed duration
pub struct RecordingPlayer {
    duration: Duration,
    played: Mutex<Vec<String>>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl RecordingPlayer {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            played: Mutex::new(Vec::new()),
            cancel: Mutex::new(None),
        })
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().clone()
    }
}

#[async_trait]
impl AudioPlayer for RecordingPlayer {
    async fn play(
        &self,
        source: AudioSource,
        on_start: StartCallback,
    ) -> Result<PlaybackOutcome, PlaybackError> {
        let label = match &source {
            AudioSource::Uri(uri) => uri.clone(),
            AudioSource::Bytes { mime, .. } => format!("<bytes {mime}>"),
        };
        self.played.lock().push(label);

        let (tx, rx) = oneshot::channel();
        *self.cancel.lock() = Some(tx);
        on_start();
        let outcome = tokio::select! {
            _ = tokio::time::sleep(self.duration) => PlaybackOutcome::Finished,
            _ = rx => PlaybackOutcome::Cancelled,
        };
        Ok(outcome)
    }

    fn stop(&self) {
        if let Some(tx) = self.cancel.lock().take() {
            let _ = tx.send(());
        }
    }

    fn is_playing(&self) -> bool {
        self.cancel.lock().is_some()
    }

    fn set_volume(&self, _volume: f32) {}
}

/// Cloud provider that always answers with the same HTTP status
pub struct FailingCloud {
    status: u16,
    calls: AtomicUsize,
}

impl FailingCloud {
    pub fn new(status: u16) -> Arc<Self> {
        Arc::new(Self {
            status,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudSpeechProvider for FailingCloud {
    fn is_configured(&self) -> bool {
        true
    }

    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>, CloudTtsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CloudTtsError::Status {
            status: self.status,
            body: "unavailable".into(),
        })
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Local engine that speaks every utterance for a fixed duration
pub struct TimedLocal {
    duration: Duration,
    spoken: Mutex<Vec<String>>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl TimedLocal {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            spoken: Mutex::new(Vec::new()),
            cancel: Mutex::new(None),
        })
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().clone()
    }
}

impl LocalSpeechEngine for TimedLocal {
    fn is_available(&self) -> bool {
        true
    }

    fn submit(
        &self,
        utterance: Utterance,
    ) -> Result<mpsc::UnboundedReceiver<UtteranceEvent>, SpeechEngineError> {
        self.spoken.lock().push(utterance.text);
        let (events, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *self.cancel.lock() = Some(cancel_tx);

        let duration = self.duration;
        tokio::spawn(async move {
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
        if let Some(tx) = self.cancel.lock().take() {
            let _ = tx.send(());
        }
    }
}
