//! Avatar runtime
//!
//! Owns one session: the event bus, the state store, the connection manager
//! and the speech orchestrator. Remote intents arriving on the bus are
//! turned into speech here, and the operator controls (presentation mode,
//! clip navigation, fullscreen) live on [`AvatarRuntime`].

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use avatar_config::{PresentationConfig, Settings};
use avatar_core::{
    AppEvent, AudioPlayer, Catalog, CloudSpeechProvider, EventBus, LocalSpeechEngine,
    SessionState, StatePatch, StateStore, Subscription,
};
use avatar_pipeline::{OrchestratorConfig, SpeakOutcome, SpeakRequest, SpeechOrchestrator};
use avatar_transport::{ConnectionManager, ConnectionState, Connector};

use crate::telemetry::{self, MetricsBridge};
use crate::Result;

/// Host collaborators injected into the runtime
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub player: Arc<dyn AudioPlayer>,
    pub cloud: Option<Arc<dyn CloudSpeechProvider>>,
    pub local: Option<Arc<dyn LocalSpeechEngine>>,
}

/// State shared with bus handlers
#[derive(Clone)]
struct Shared {
    store: Arc<StateStore>,
    catalog: Arc<Catalog>,
    speech: SpeechOrchestrator,
    presentation: Arc<PresentationConfig>,
    cursor: Arc<Mutex<usize>>,
    destroyed: Arc<AtomicBool>,
}

impl Shared {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn play_clip(&self, id: &str) -> Option<JoinHandle<SpeakOutcome>> {
        if self.is_destroyed() {
            return None;
        }
        let Some(position) = self.catalog.position(id) else {
            tracing::info!(audio_id = %id, "Ignoring unknown clip");
            telemetry::record_speak_ignored();
            return None;
        };
        let handle = runtime_handle()?;

        *self.cursor.lock() = position;
        self.store
            .update(StatePatch::new().current_audio_id(Some(id.to_string())));

        let presenting = self.store.state().is_presentation_mode;
        if presenting && id == self.presentation.start_id {
            tracing::info!(audio_id = %id, "Opening clip, revealing avatar");
        }
        let closing = presenting && id == self.presentation.end_id;

        tracing::info!(audio_id = %id, "Playing clip");
        let speech = self.speech.speak(SpeakRequest::clip(id));
        let id = id.to_string();
        Some(handle.spawn(async move {
            let outcome = speech.await;
            if closing && matches!(outcome, SpeakOutcome::Completed(_)) {
                tracing::info!(audio_id = %id, "Closing clip finished, hiding avatar");
            }
            outcome
        }))
    }

    fn say(&self, text: String) -> Option<JoinHandle<SpeakOutcome>> {
        if self.is_destroyed() {
            return None;
        }
        let handle = runtime_handle()?;
        tracing::info!(chars = text.chars().count(), "Speaking text");
        Some(spawn_on(&handle, self.speech.speak(SpeakRequest::text(text))))
    }

    fn on_speak_start(&self, audio_id: Option<&String>, text: Option<&String>) {
        match (audio_id, text) {
            (Some(id), _) => {
                self.play_clip(id);
            }
            (None, Some(text)) => {
                self.say(text.clone());
            }
            (None, None) => tracing::debug!("speak:start without clip or text"),
        }
    }

    fn on_speak_end(&self) {
        let state = self.store.state();
        if state.is_presentation_mode
            && state.current_audio_id.as_deref() == Some(self.presentation.end_id.as_str())
        {
            tracing::info!("Closing clip interrupted, hiding avatar");
        }
        self.speech.stop();
        self.store.update(StatePatch::new().current_audio_id(None));
    }
}

fn runtime_handle() -> Option<Handle> {
    match Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(_) => {
            tracing::warn!("No async runtime, speech request dropped");
            None
        }
    }
}

fn spawn_on<F>(handle: &Handle, future: F) -> JoinHandle<SpeakOutcome>
where
    F: Future<Output = SpeakOutcome> + Send + 'static,
{
    handle.spawn(future)
}

/// One avatar session
pub struct AvatarRuntime {
    session_id: Uuid,
    bus: EventBus,
    connection: ConnectionManager,
    shared: Shared,
    subscriptions: Mutex<Vec<Subscription>>,
    metrics: Mutex<Option<MetricsBridge>>,
}

impl AvatarRuntime {
    pub fn new(settings: &Settings, catalog: Catalog, collaborators: Collaborators) -> Result<Self> {
        let bus = EventBus::new();
        let store = Arc::new(StateStore::new(bus.clone()));
        let catalog = Arc::new(catalog);

        let mut builder = SpeechOrchestrator::builder(
            OrchestratorConfig::from_settings(settings),
            catalog.clone(),
            store.clone(),
            bus.clone(),
            collaborators.player,
        );
        if let Some(cloud) = collaborators.cloud {
            builder = builder.cloud(cloud);
        }
        if let Some(local) = collaborators.local {
            builder = builder.local(local);
        }
        let speech = builder.build()?;

        let connection =
            ConnectionManager::from_config(&settings.connection, collaborators.connector, bus.clone());

        let shared = Shared {
            store,
            catalog,
            speech,
            presentation: Arc::new(settings.presentation.clone()),
            cursor: Arc::new(Mutex::new(0)),
            destroyed: Arc::new(AtomicBool::new(false)),
        };
        let subscriptions = wire(&bus, &shared);
        let metrics = MetricsBridge::attach(&bus);

        let session_id = Uuid::new_v4();
        tracing::debug!(session_id = %session_id, clips = shared.catalog.len(), "Avatar runtime created");

        Ok(Self {
            session_id,
            bus,
            connection,
            shared,
            subscriptions: Mutex::new(subscriptions),
            metrics: Mutex::new(Some(metrics)),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.shared.store
    }

    pub fn state(&self) -> Arc<SessionState> {
        self.shared.store.state()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.shared.catalog
    }

    pub fn speech(&self) -> &SpeechOrchestrator {
        &self.shared.speech
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Connect to the control channel
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        if self.is_destroyed() {
            return;
        }
        self.connection.connect();
    }

    pub fn send<T: Serialize>(&self, message: &T) -> bool {
        self.connection.send(message)
    }

    /// Speak a request, spawned on the current runtime
    pub fn speak(&self, request: SpeakRequest) -> Option<JoinHandle<SpeakOutcome>> {
        if self.is_destroyed() {
            return None;
        }
        let handle = runtime_handle()?;
        Some(spawn_on(&handle, self.shared.speech.speak(request)))
    }

    /// Play a catalog clip; `None` when the id is unknown
    pub fn play_clip(&self, id: &str) -> Option<JoinHandle<SpeakOutcome>> {
        self.shared.play_clip(id)
    }

    pub fn say(&self, text: impl Into<String>) -> Option<JoinHandle<SpeakOutcome>> {
        self.shared.say(text.into())
    }

    pub fn stop_speaking(&self) {
        if !self.is_destroyed() {
            self.shared.speech.stop();
        }
    }

    /// Stop when speaking, otherwise play the first clip
    pub fn toggle_play(&self) -> Option<JoinHandle<SpeakOutcome>> {
        if self.is_destroyed() {
            return None;
        }
        if self.shared.speech.is_speaking() {
            self.shared.speech.stop();
            return None;
        }
        let first = self.shared.catalog.at(0)?.id.clone();
        self.shared.play_clip(&first)
    }

    /// Advance to the next clip, wrapping at the end
    pub fn next_clip(&self) -> Option<String> {
        self.step_clip(1)
    }

    /// Go back to the previous clip, wrapping at the start
    pub fn previous_clip(&self) -> Option<String> {
        self.step_clip(-1)
    }

    fn step_clip(&self, step: isize) -> Option<String> {
        if self.is_destroyed() {
            return None;
        }
        let len = self.shared.catalog.len();
        if len == 0 {
            tracing::warn!("No clips available");
            return None;
        }
        let position = {
            let mut cursor = self.shared.cursor.lock();
            *cursor = (*cursor as isize + step).rem_euclid(len as isize) as usize;
            *cursor
        };
        let id = self.shared.catalog.at(position)?.id.clone();
        self.shared.play_clip(&id);
        Some(id)
    }

    /// Index of the clip navigation starts from
    pub fn clip_cursor(&self) -> usize {
        *self.shared.cursor.lock()
    }

    pub fn enter_presentation_mode(&self) {
        if self.is_destroyed() || self.state().is_presentation_mode {
            return;
        }
        self.shared
            .store
            .update(StatePatch::new().presentation_mode(true));
        self.shared.speech.preload_catalog();
        telemetry::record_presentation("start");
        tracing::info!("Presentation mode entered");
    }

    pub fn exit_presentation_mode(&self) {
        if self.is_destroyed() || !self.state().is_presentation_mode {
            return;
        }
        self.shared
            .store
            .update(StatePatch::new().presentation_mode(false));
        self.shared.speech.stop();
        telemetry::record_presentation("end");
        tracing::info!("Presentation mode exited");
    }

    /// Flip fullscreen; ignored in presentation mode
    pub fn toggle_fullscreen(&self) -> bool {
        let state = self.state();
        if self.is_destroyed() || state.is_presentation_mode {
            return state.is_fullscreen;
        }
        let next = !state.is_fullscreen;
        self.shared.store.update(StatePatch::new().fullscreen(next));
        next
    }

    pub fn set_avatar_ready(&self, ready: bool) {
        if !self.is_destroyed() {
            self.shared.store.update(StatePatch::new().avatar_ready(ready));
        }
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.speech.set_volume(volume);
    }

    pub fn lip_sync(&self) -> watch::Receiver<u8> {
        self.shared.speech.lip_sync()
    }

    pub fn subtitles(&self) -> watch::Receiver<String> {
        self.shared.speech.subtitles()
    }

    /// Tear the session down; later calls are no-ops
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        if let Some(mut metrics) = self.metrics.lock().take() {
            metrics.detach();
        }
        self.connection.destroy();
        self.shared.speech.destroy();
        self.shared.store.destroy();
        self.bus.clear();
        tracing::info!(session_id = %self.session_id, "Avatar runtime destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }
}

impl Drop for AvatarRuntime {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Route remote intents and connection events into the session
fn wire(bus: &EventBus, shared: &Shared) -> Vec<Subscription> {
    let mut subscriptions = Vec::new();

    let s = shared.clone();
    subscriptions.push(bus.on(AppEvent::SPEAK_START, move |event| {
        if s.is_destroyed() {
            return;
        }
        if let AppEvent::SpeakStart { audio_id, text } = event {
            s.on_speak_start(audio_id.as_ref(), text.as_ref());
        }
    }));

    let s = shared.clone();
    subscriptions.push(bus.on(AppEvent::SPEAK_END, move |_| {
        if !s.is_destroyed() {
            s.on_speak_end();
        }
    }));

    let s = shared.clone();
    subscriptions.push(bus.on(AppEvent::MESSAGE_RECEIVED, move |event| {
        if let AppEvent::MessageReceived { text } = event {
            s.speech.show_subtitle(text.clone());
        }
    }));

    let store = shared.store.clone();
    subscriptions.push(bus.on(AppEvent::WS_CONNECTED, move |_| {
        store.update(StatePatch::new().connected(true));
    }));

    let store = shared.store.clone();
    subscriptions.push(bus.on(AppEvent::WS_DISCONNECTED, move |event| {
        if let AppEvent::WsDisconnected { code } = event {
            tracing::info!(code, "Control channel closed");
        }
        store.update(StatePatch::new().connected(false));
    }));

    subscriptions.push(bus.on(AppEvent::WS_MAX_RECONNECTS, |event| {
        if let AppEvent::WsMaxReconnects { attempts } = event {
            tracing::error!(attempts, "Gave up reconnecting to the control channel");
        }
    }));

    subscriptions
}
