//! Reconnecting connection manager
//!
//! Owns at most one live connection to the command endpoint and keeps it
//! alive with jittered exponential backoff. Inbound frames are validated,
//! translated into [`AppEvent`]s, and published on the bus:
//!
//! | frame                | event                          |
//! |----------------------|--------------------------------|
//! | `bot_speaking_start` | `speak:start {audioId, text}`  |
//! | `bot_speaking_end`   | `speak:end`                    |
//! | `bot_message`        | `message:received {text}`      |
//! | `ping`               | none, replies `{"type":"pong"}`|
//! | `pong`, `connected`  | `ws:message`                   |
//!
//! Each `connect` starts a new generation. Tasks belonging to an older
//! generation stop acting as soon as they notice, so a superseded socket can
//! never emit events or schedule reconnects.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use avatar_config::ConnectionConfig;
use avatar_core::{AppEvent, Backoff, EventBus};

use crate::protocol::{InboundMessage, OutboundMessage};
use crate::validator::{is_valid_audio_id, validate, validate_frame};
use crate::TransportError;

/// Close code reported when the connection drops without a close frame
pub const ABNORMAL_CLOSE: u16 = 1006;

/// What a connection delivers to the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Binary(Vec<u8>),
    Error(String),
    Closed { code: u16 },
}

/// An open connection: frames out, events in
///
/// Dropping `outbound` closes the connection.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to an endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, endpoint: &str) -> Result<Connection, TransportError>;
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reconnect limits and delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionPolicy {
    pub max_reconnect_attempts: u32,
    pub backoff: Backoff,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ConnectionPolicy {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            max_reconnect_attempts: config.max_reconnect_attempts,
            backoff: Backoff::new(config.base_delay(), config.max_delay(), config.jitter()),
        }
    }
}

struct Session {
    phase: ConnectionState,
    attempts: u32,
    generation: u64,
    outbound: Option<mpsc::Sender<String>>,
    session_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

struct Inner {
    endpoint: Option<String>,
    policy: ConnectionPolicy,
    connector: Arc<dyn Connector>,
    bus: EventBus,
    session: Mutex<Session>,
    destroyed: AtomicBool,
}

/// Handle to the connection manager, cheap to clone
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: Option<String>,
        policy: ConnectionPolicy,
        connector: Arc<dyn Connector>,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.filter(|e| !e.is_empty()),
                policy,
                connector,
                bus,
                session: Mutex::new(Session {
                    phase: ConnectionState::Disconnected,
                    attempts: 0,
                    generation: 0,
                    outbound: None,
                    session_task: None,
                    reconnect_task: None,
                }),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(config: &ConnectionConfig, connector: Arc<dyn Connector>, bus: EventBus) -> Self {
        Self::new(
            config.endpoint.clone(),
            ConnectionPolicy::from(config),
            connector,
            bus,
        )
    }

    /// Open a connection, replacing any existing one
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Operator reconnect: fresh attempt budget, then connect
    pub fn reconnect(&self) {
        if self.inner.is_destroyed() {
            return;
        }
        self.inner.session.lock().attempts = 0;
        self.inner.connect();
    }

    /// Close without reconnecting
    ///
    /// The close handling is detached first, so no `ws:disconnected` is
    /// emitted for a deliberate disconnect.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Best-effort send; returns false when the frame was dropped
    pub fn send<T: Serialize>(&self, message: &T) -> bool {
        self.inner.send(message)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.session.lock().attempts
    }

    /// Disconnect and turn every further call into a no-op
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.teardown();
        tracing::debug!("Connection manager destroyed");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .field("attempts", &self.reconnect_attempts())
            .finish()
    }
}

impl Inner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session.lock().generation == generation
    }

    fn connect(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let Some(endpoint) = self.endpoint.clone() else {
            tracing::warn!("No endpoint configured, not connecting");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("connect() called outside a Tokio runtime");
            return;
        };

        let mut session = self.session.lock();
        if let Some(timer) = session.reconnect_task.take() {
            timer.abort();
        }
        if let Some(task) = session.session_task.take() {
            task.abort();
        }
        session.outbound = None;
        session.generation += 1;
        session.phase = ConnectionState::Connecting;
        let generation = session.generation;

        tracing::info!(endpoint = %endpoint, generation, "Connecting");
        let weak = Arc::downgrade(self);
        session.session_task = Some(runtime.spawn(run_session(weak, generation, endpoint)));
    }

    fn disconnect(&self) {
        if self.is_destroyed() {
            return;
        }
        self.teardown();
        tracing::info!("Disconnected");
    }

    fn teardown(&self) {
        let mut session = self.session.lock();
        session.attempts = self.policy.max_reconnect_attempts;
        session.generation += 1;
        if let Some(timer) = session.reconnect_task.take() {
            timer.abort();
        }
        if let Some(task) = session.session_task.take() {
            task.abort();
        }
        session.outbound = None;
        session.phase = ConnectionState::Disconnected;
    }

    fn on_open(&self, generation: u64, outbound: mpsc::Sender<String>) -> bool {
        {
            let mut session = self.session.lock();
            if session.generation != generation {
                return false;
            }
            session.phase = ConnectionState::Connected;
            session.attempts = 0;
            session.outbound = Some(outbound);
        }
        tracing::info!(generation, "Connected");
        self.bus.emit(AppEvent::WsConnected);
        true
    }

    fn on_closed(self: &Arc<Self>, generation: u64, code: u16) {
        {
            let mut session = self.session.lock();
            if session.generation != generation {
                return;
            }
            session.phase = ConnectionState::Disconnected;
            session.outbound = None;
            session.session_task = None;
        }
        tracing::info!(code, "Connection closed");
        self.bus.emit(AppEvent::WsDisconnected { code });
        self.schedule_reconnect(generation);
    }

    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        if self.is_destroyed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let mut session = self.session.lock();
        if session.generation != generation {
            return;
        }
        if session.attempts >= self.policy.max_reconnect_attempts {
            let attempts = session.attempts;
            drop(session);
            tracing::error!(attempts, "Maximum reconnect attempts reached");
            self.bus.emit(AppEvent::WsMaxReconnects { attempts });
            return;
        }

        session.attempts += 1;
        let attempt = session.attempts;
        let delay = self.policy.backoff.delay(attempt);
        tracing::info!(
            attempt,
            max = self.policy.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let weak = Arc::downgrade(self);
        session.reconnect_task = Some(runtime.spawn(reconnect_after(weak, generation, delay)));
    }

    fn send<T: Serialize>(&self, message: &T) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let outbound = {
            let session = self.session.lock();
            match (&session.phase, &session.outbound) {
                (ConnectionState::Connected, Some(tx)) => tx.clone(),
                _ => {
                    tracing::warn!("Not connected, message dropped");
                    return false;
                }
            }
        };

        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize outbound message");
                return false;
            }
        };

        match outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Outbound buffer full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Connection writer closed, message dropped");
                false
            }
        }
    }

    fn handle_text(&self, raw: &str) {
        match validate(raw) {
            Ok(message) => self.dispatch(message),
            Err(e) => tracing::warn!(error = %e, "Dropping invalid frame"),
        }
    }

    fn handle_binary(&self, raw: &[u8]) {
        match validate_frame(raw) {
            Ok(message) => self.dispatch(message),
            Err(e) => tracing::warn!(error = %e, "Dropping invalid binary frame"),
        }
    }

    fn dispatch(&self, message: InboundMessage) {
        tracing::debug!(kind = message.kind(), clip = ?message.clip_id(), "Inbound message");

        match message {
            InboundMessage::BotSpeakingStart { ref text, .. } => {
                let audio_id = message.clip_id().map(str::to_string);
                if let Some(id) = &audio_id {
                    if !is_valid_audio_id(id) {
                        tracing::warn!(audio_id = %id, "Dropping speaking request with invalid clip id");
                        return;
                    }
                }
                let text = text.clone().filter(|t| !t.is_empty());
                self.bus.emit(AppEvent::SpeakStart { audio_id, text });
            }
            InboundMessage::BotSpeakingEnd => {
                self.bus.emit(AppEvent::SpeakEnd);
            }
            InboundMessage::BotMessage { text } => {
                self.bus.emit(AppEvent::MessageReceived { text });
            }
            InboundMessage::Ping => {
                self.send(&OutboundMessage::Pong);
            }
            InboundMessage::Pong | InboundMessage::Connected => {
                match serde_json::to_value(&message) {
                    Ok(message) => {
                        self.bus.emit(AppEvent::WsMessage { message });
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to re-encode message"),
                }
            }
        }
    }
}

async fn reconnect_after(inner: Weak<Inner>, generation: u64, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    {
        let mut session = inner.session.lock();
        if session.generation != generation {
            return;
        }
        // this task is finishing; connect() must not abort it
        session.reconnect_task = None;
    }
    inner.connect();
}

async fn run_session(inner: Weak<Inner>, generation: u64, endpoint: String) {
    let Some(connector) = inner.upgrade().map(|i| Arc::clone(&i.connector)) else {
        return;
    };
    let opened = connector.open(&endpoint).await;

    let Some(manager) = inner.upgrade() else {
        return;
    };
    let mut inbound = match opened {
        Ok(connection) => {
            if !manager.on_open(generation, connection.outbound) {
                return;
            }
            connection.inbound
        }
        Err(e) => {
            if !manager.is_current(generation) {
                return;
            }
            tracing::warn!(error = %e, "Failed to open connection");
            manager.bus.emit(AppEvent::WsError {
                message: e.to_string(),
            });
            manager.on_closed(generation, ABNORMAL_CLOSE);
            return;
        }
    };
    drop(manager);

    while let Some(event) = inbound.recv().await {
        let Some(manager) = inner.upgrade() else {
            return;
        };
        if !manager.is_current(generation) {
            return;
        }
        match event {
            TransportEvent::Text(text) => manager.handle_text(&text),
            TransportEvent::Binary(bytes) => manager.handle_binary(&bytes),
            TransportEvent::Error(message) => {
                tracing::warn!(error = %message, "Connection error");
                manager.bus.emit(AppEvent::WsError { message });
            }
            TransportEvent::Closed { code } => {
                manager.on_closed(generation, code);
                return;
            }
        }
    }

    if let Some(manager) = inner.upgrade() {
        manager.on_closed(generation, ABNORMAL_CLOSE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avatar_core::EventBus;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Peer side of a mock connection
    struct Peer {
        to_client: mpsc::Sender<TransportEvent>,
        from_client: mpsc::Receiver<String>,
    }

    #[derive(Default)]
    struct MockConnector {
        opens: AtomicUsize,
        /// true = accept, false = refuse; refuse once the script runs out
        script: Mutex<VecDeque<bool>>,
        peers: Mutex<Vec<Peer>>,
    }

    impl MockConnector {
        fn scripted(script: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                ..Default::default()
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn take_peer(&self) -> Peer {
            self.peers.lock().remove(0)
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn open(&self, _endpoint: &str) -> Result<Connection, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if !self.script.lock().pop_front().unwrap_or(false) {
                return Err(TransportError::Connect("refused".into()));
            }
            let (out_tx, out_rx) = mpsc::channel(8);
            let (in_tx, in_rx) = mpsc::channel(8);
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

    fn recorder(bus: &EventBus, topics: &[&str]) -> Arc<Mutex<Vec<AppEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for topic in topics {
            let log = log.clone();
            bus.on(topic, move |e| log.lock().push(e.clone()));
        }
        log
    }

    fn manager(connector: Arc<MockConnector>, bus: &EventBus) -> ConnectionManager {
        ConnectionManager::new(
            Some("ws://test/ws".into()),
            ConnectionPolicy::default(),
            connector,
            bus.clone(),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_emits_connected_and_resets_attempts() {
        let bus = EventBus::new();
        let events = recorder(&bus, &[AppEvent::WS_CONNECTED]);
        let connector = MockConnector::scripted(&[true]);
        let manager = manager(connector.clone(), &bus);

        manager.connect();
        settle().await;

        assert!(manager.is_connected());
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(*events.lock(), vec![AppEvent::WsConnected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_endpoint_is_noop() {
        let bus = EventBus::new();
        let connector = MockConnector::scripted(&[true]);
        let manager =
            ConnectionManager::new(None, ConnectionPolicy::default(), connector.clone(), bus);

        manager.connect();
        settle().await;
        assert_eq!(connector.opens(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_budget() {
        let bus = EventBus::new();
        let events = recorder(
            &bus,
            &[AppEvent::WS_MAX_RECONNECTS, AppEvent::WS_DISCONNECTED],
        );
        let connector = MockConnector::scripted(&[]);
        let manager = manager(connector.clone(), &bus);

        manager.connect();
        // every delay is capped at 30s
        tokio::time::sleep(Duration::from_secs(15 * 30)).await;

        // initial attempt plus ten reconnects
        assert_eq!(connector.opens(), 11);
        let events = events.lock();
        assert_eq!(
            events.last(),
            Some(&AppEvent::WsMaxReconnects { attempts: 10 })
        );
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, AppEvent::WsDisconnected { code: ABNORMAL_CLOSE }))
                .count(),
            11
        );

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(connector.opens(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delay_is_bounded() {
        let bus = EventBus::new();
        let connector = MockConnector::scripted(&[]);
        let manager = manager(connector.clone(), &bus);

        manager.connect();
        settle().await;
        assert_eq!(connector.opens(), 1);

        // first retry lands within [1s, 2s)
        tokio::time::sleep(Duration::from_millis(990)).await;
        assert_eq!(connector.opens(), 1);
        tokio::time::sleep(Duration::from_millis(1020)).await;
        assert_eq!(connector.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_triggers_reconnect() {
        let bus = EventBus::new();
        let events = recorder(&bus, &[AppEvent::WS_CONNECTED, AppEvent::WS_DISCONNECTED]);
        let connector = MockConnector::scripted(&[true, true]);
        let manager = manager(connector.clone(), &bus);

        manager.connect();
        settle().await;
        let peer = connector.take_peer();
        peer.to_client
            .send(TransportEvent::Closed { code: 1001 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(connector.opens(), 2);
        assert!(manager.is_connected());
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(
            *events.lock(),
            vec![
                AppEvent::WsConnected,
                AppEvent::WsDisconnected { code: 1001 },
                AppEvent::WsConnected
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_silent_and_final() {
        let bus = EventBus::new();
        let events = recorder(&bus, &[AppEvent::WS_DISCONNECTED]);
        let connector = MockConnector::scripted(&[true, true]);
        let manager = manager(connector.clone(), &bus);

        manager.connect();
        settle().await;
        let mut peer = connector.take_peer();

        manager.disconnect();
        settle().await;
        // the writer side is released
        assert_eq!(peer.from_client.recv().await, None);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(events.lock().is_empty());
        assert_eq!(connector.opens(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_reconnect_after_giving_up() {
        let bus = EventBus::new();
        let connector = MockConnector::scripted(&[]);
        let manager = manager(connector.clone(), &bus);

        manager.connect();
        tokio::time::sleep(Duration::from_secs(15 * 30)).await;
        assert_eq!(connector.opens(), 11);

        connector.script.lock().push_back(true);
        manager.reconnect();
        settle().await;
        assert_eq!(connector.opens(), 12);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_become_events() {
        let bus = EventBus::new();
        let events = recorder(
            &bus,
            &[
                AppEvent::SPEAK_START,
                AppEvent::SPEAK_END,
                AppEvent::MESSAGE_RECEIVED,
                AppEvent::WS_MESSAGE,
            ],
        );
        let connector = MockConnector::scripted(&[true]);
        let manager = manager(connector.clone(), &bus);
        manager.connect();
        settle().await;
        let peer = connector.take_peer();

        for frame in [
            "{not json",
            r#"{"type":"bot_speaking_start","lineId":"que_es_1","text":"hola"}"#,
            r#"{"type":"bot_speaking_start","audioId":"../../etc"}"#,
            r#"{"type":"shell","cmd":"rm"}"#,
            r#"{"type":"bot_message","text":"hi\u0000"}"#,
            r#"{"type":"connected"}"#,
            r#"{"type":"bot_speaking_end"}"#,
        ] {
            peer.to_client
                .send(TransportEvent::Text(frame.to_string()))
                .await
                .unwrap();
        }
        peer.to_client
            .send(TransportEvent::Binary(vec![0xff, 0x00]))
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            *events.lock(),
            vec![
                AppEvent::SpeakStart {
                    audio_id: Some("que_es_1".into()),
                    text: Some("hola".into()),
                },
                AppEvent::MessageReceived { text: "hi".into() },
                AppEvent::WsMessage {
                    message: serde_json::json!({"type": "connected"})
                },
                AppEvent::SpeakEnd,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_is_answered() {
        let bus = EventBus::new();
        let connector = MockConnector::scripted(&[true]);
        let manager = manager(connector.clone(), &bus);
        manager.connect();
        settle().await;
        let mut peer = connector.take_peer();

        peer.to_client
            .send(TransportEvent::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            peer.from_client.recv().await.as_deref(),
            Some(r#"{"type":"pong"}"#)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_when_disconnected_is_dropped() {
        let bus = EventBus::new();
        let connector = MockConnector::scripted(&[]);
        let manager = manager(connector, &bus);
        assert!(!manager.send(&serde_json::json!({"type": "hello"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_makes_calls_noops() {
        let bus = EventBus::new();
        let connector = MockConnector::scripted(&[true, true]);
        let manager = manager(connector.clone(), &bus);
        manager.connect();
        settle().await;

        manager.destroy();
        manager.destroy();
        manager.connect();
        manager.reconnect();
        settle().await;

        assert_eq!(connector.opens(), 1);
        assert!(!manager.is_connected());
        assert!(!manager.send(&OutboundMessage::Pong));
    }
}
