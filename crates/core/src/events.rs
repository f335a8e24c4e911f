//! In-process publish/subscribe bus
//!
//! Dispatch is synchronous: `emit` runs every handler subscribed to the
//! event's topic, in subscription order, before returning. The handler list
//! is snapshotted first and no lock is held while handlers run, so a handler
//! may subscribe, unsubscribe, or emit again. A nested emit runs to
//! completion before the outer dispatch continues.
//!
//! Topics are the strings the rest of the system already speaks
//! (`ws:connected`, `speak:start`, `state:isSpeaking`, ...), see
//! [`AppEvent::topic`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::state::{FieldChange, StateChange};
use crate::traits::BackendKind;

/// Every event that travels on the bus
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// Connection opened
    WsConnected,
    /// Connection closed, normally or not
    WsDisconnected { code: u16 },
    /// Transport-level error (open failure, read error)
    WsError { message: String },
    /// Reconnect budget exhausted, no further attempts
    WsMaxReconnects { attempts: u32 },
    /// Valid inbound message with no dedicated event
    WsMessage { message: serde_json::Value },

    /// Remote intent to speak a clip or text
    SpeakStart {
        audio_id: Option<String>,
        text: Option<String>,
    },
    /// Remote intent to stop speaking
    SpeakEnd,
    /// Remote chat text to display
    MessageReceived { text: String },

    /// Emitted once per state update
    StateChanged(StateChange),
    /// Emitted per field whose value changed
    StateField(FieldChange),

    /// Audio for a request became audible
    SpeechStart { generation: u64, backend: BackendKind },
    /// A request finished speaking
    SpeechEnd { generation: u64, backend: BackendKind },
    /// A request failed on the given backend
    SpeechError {
        generation: u64,
        backend: BackendKind,
        message: String,
    },
    /// The cascade moved from one backend to the next
    SpeechFallback {
        generation: u64,
        from: BackendKind,
        to: BackendKind,
    },
}

impl AppEvent {
    pub const WS_CONNECTED: &'static str = "ws:connected";
    pub const WS_DISCONNECTED: &'static str = "ws:disconnected";
    pub const WS_ERROR: &'static str = "ws:error";
    pub const WS_MAX_RECONNECTS: &'static str = "ws:max_reconnects";
    pub const WS_MESSAGE: &'static str = "ws:message";
    pub const SPEAK_START: &'static str = "speak:start";
    pub const SPEAK_END: &'static str = "speak:end";
    pub const MESSAGE_RECEIVED: &'static str = "message:received";
    pub const STATE_CHANGED: &'static str = "state:changed";
    pub const SPEECH_START: &'static str = "speech:start";
    pub const SPEECH_END: &'static str = "speech:end";
    pub const SPEECH_ERROR: &'static str = "speech:error";
    pub const SPEECH_FALLBACK: &'static str = "speech:fallback";

    /// Topic this event is delivered on
    pub fn topic(&self) -> &'static str {
        match self {
            AppEvent::WsConnected => Self::WS_CONNECTED,
            AppEvent::WsDisconnected { .. } => Self::WS_DISCONNECTED,
            AppEvent::WsError { .. } => Self::WS_ERROR,
            AppEvent::WsMaxReconnects { .. } => Self::WS_MAX_RECONNECTS,
            AppEvent::WsMessage { .. } => Self::WS_MESSAGE,
            AppEvent::SpeakStart { .. } => Self::SPEAK_START,
            AppEvent::SpeakEnd => Self::SPEAK_END,
            AppEvent::MessageReceived { .. } => Self::MESSAGE_RECEIVED,
            AppEvent::StateChanged(_) => Self::STATE_CHANGED,
            AppEvent::StateField(change) => change.field.topic(),
            AppEvent::SpeechStart { .. } => Self::SPEECH_START,
            AppEvent::SpeechEnd { .. } => Self::SPEECH_END,
            AppEvent::SpeechError { .. } => Self::SPEECH_ERROR,
            AppEvent::SpeechFallback { .. } => Self::SPEECH_FALLBACK,
        }
    }
}

/// Event handler
pub type Handler = Arc<dyn Fn(&AppEvent) + Send + Sync + 'static>;

/// Identifies one subscription on one topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry {
    id: SubscriptionId,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    topics: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = self.topics.lock();
        let Some(entries) = topics.get_mut(topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            topics.remove(topic);
        }
        removed
    }
}

/// Handle returned by [`EventBus::on`] and [`EventBus::once`]
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    bus: Weak<BusInner>,
    topic: String,
    id: SubscriptionId,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(&self.topic, self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner").finish_non_exhaustive()
    }
}

/// Synchronous event bus, cheap to clone
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic
    pub fn on<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(handler), false)
    }

    /// Subscribe for a single delivery
    ///
    /// The subscription is removed before the handler runs, so an emit from
    /// inside the handler does not reach it again.
    pub fn once<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(handler), true)
    }

    /// Remove a handler by id
    pub fn off(&self, topic: &str, id: SubscriptionId) -> bool {
        self.inner.remove(topic, id)
    }

    fn subscribe(&self, topic: &str, handler: Handler, once: bool) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Entry { id, once, handler });

        Subscription {
            bus: Arc::downgrade(&self.inner),
            topic: topic.to_string(),
            id,
        }
    }

    /// Deliver an event to every handler of its topic
    ///
    /// Returns the number of handlers invoked. A panicking handler is logged
    /// and skipped; the remaining handlers still run.
    pub fn emit(&self, event: AppEvent) -> usize {
        let topic = event.topic();
        let snapshot: Vec<Handler> = {
            let mut topics = self.inner.topics.lock();
            let Some(entries) = topics.get_mut(topic) else {
                return 0;
            };
            let handlers = entries.iter().map(|e| Arc::clone(&e.handler)).collect();
            entries.retain(|e| !e.once);
            if entries.is_empty() {
                topics.remove(topic);
            }
            handlers
        };

        for handler in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!(topic, "Event handler panicked");
            }
        }
        snapshot.len()
    }

    /// Number of handlers currently subscribed to a topic
    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop every subscription
    pub fn clear(&self) {
        self.inner.topics.lock().clear();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.inner.topics.lock();
        f.debug_struct("EventBus")
            .field("topics", &topics.keys().collect::<Vec<_>>())
            .finish()
    }
}
