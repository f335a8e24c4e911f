//! Immutable session state store
//!
//! Every mutation produces a new [`SessionState`] snapshot; readers holding
//! an older `Arc<SessionState>` never observe a change. Updates are published
//! on the [`EventBus`] after the swap, outside the lock:
//!
//! - one `state:changed` per update, carrying old/new snapshots and the patch
//! - one `state:<field>` per field whose value actually changed

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::events::{AppEvent, EventBus, Subscription};

/// Number of updates retained for diagnostics
pub const HISTORY_LIMIT: usize = 50;

/// Snapshot of the widget session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub is_presentation_mode: bool,
    pub current_audio_id: Option<String>,
    pub is_fullscreen: bool,
    pub is_speaking: bool,
    pub is_connected: bool,
    pub avatar_ready: bool,
}

impl SessionState {
    /// Read a single field
    pub fn get(&self, field: StateField) -> StateValue {
        match field {
            StateField::PresentationMode => StateValue::Bool(self.is_presentation_mode),
            StateField::CurrentAudioId => StateValue::Text(self.current_audio_id.clone()),
            StateField::Fullscreen => StateValue::Bool(self.is_fullscreen),
            StateField::Speaking => StateValue::Bool(self.is_speaking),
            StateField::Connected => StateValue::Bool(self.is_connected),
            StateField::AvatarReady => StateValue::Bool(self.avatar_ready),
        }
    }

    fn apply(&self, patch: &StatePatch) -> SessionState {
        let mut next = self.clone();
        if let Some(v) = patch.is_presentation_mode {
            next.is_presentation_mode = v;
        }
        if let Some(v) = &patch.current_audio_id {
            next.current_audio_id = v.clone();
        }
        if let Some(v) = patch.is_fullscreen {
            next.is_fullscreen = v;
        }
        if let Some(v) = patch.is_speaking {
            next.is_speaking = v;
        }
        if let Some(v) = patch.is_connected {
            next.is_connected = v;
        }
        if let Some(v) = patch.avatar_ready {
            next.avatar_ready = v;
        }
        next
    }
}

/// Addressable state fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateField {
    PresentationMode,
    CurrentAudioId,
    Fullscreen,
    Speaking,
    Connected,
    AvatarReady,
}

impl StateField {
    pub const ALL: [StateField; 6] = [
        StateField::PresentationMode,
        StateField::CurrentAudioId,
        StateField::Fullscreen,
        StateField::Speaking,
        StateField::Connected,
        StateField::AvatarReady,
    ];

    /// Wire name of the field
    pub fn as_str(&self) -> &'static str {
        match self {
            StateField::PresentationMode => "isPresentationMode",
            StateField::CurrentAudioId => "currentAudioId",
            StateField::Fullscreen => "isFullscreen",
            StateField::Speaking => "isSpeaking",
            StateField::Connected => "isConnected",
            StateField::AvatarReady => "avatarReady",
        }
    }

    /// Bus topic carrying changes of this field
    pub fn topic(&self) -> &'static str {
        match self {
            StateField::PresentationMode => "state:isPresentationMode",
            StateField::CurrentAudioId => "state:currentAudioId",
            StateField::Fullscreen => "state:isFullscreen",
            StateField::Speaking => "state:isSpeaking",
            StateField::Connected => "state:isConnected",
            StateField::AvatarReady => "state:avatarReady",
        }
    }
}

/// Value of one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Text(Option<String>),
}

/// Partial update; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_presentation_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_audio_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_fullscreen: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_speaking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_ready: Option<bool>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patch that sets every field to the value in `state`
    pub fn full(state: &SessionState) -> Self {
        Self {
            is_presentation_mode: Some(state.is_presentation_mode),
            current_audio_id: Some(state.current_audio_id.clone()),
            is_fullscreen: Some(state.is_fullscreen),
            is_speaking: Some(state.is_speaking),
            is_connected: Some(state.is_connected),
            avatar_ready: Some(state.avatar_ready),
        }
    }

    pub fn presentation_mode(mut self, value: bool) -> Self {
        self.is_presentation_mode = Some(value);
        self
    }

    pub fn current_audio_id(mut self, value: Option<String>) -> Self {
        self.current_audio_id = Some(value);
        self
    }

    pub fn fullscreen(mut self, value: bool) -> Self {
        self.is_fullscreen = Some(value);
        self
    }

    pub fn speaking(mut self, value: bool) -> Self {
        self.is_speaking = Some(value);
        self
    }

    pub fn connected(mut self, value: bool) -> Self {
        self.is_connected = Some(value);
        self
    }

    pub fn avatar_ready(mut self, value: bool) -> Self {
        self.avatar_ready = Some(value);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Payload of `state:changed`
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub old: Arc<SessionState>,
    pub new: Arc<SessionState>,
    pub patch: StatePatch,
    /// Fields whose value differs between `old` and `new`
    pub changed: Vec<StateField>,
}

/// Payload of `state:<field>`
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: StateField,
    pub old: StateValue,
    pub new: StateValue,
}

/// One recorded update
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub patch: StatePatch,
    pub from: Arc<SessionState>,
    pub to: Arc<SessionState>,
}

struct StoreInner {
    current: Arc<SessionState>,
    history: VecDeque<HistoryEntry>,
}

/// Owner of the session state
pub struct StateStore {
    bus: EventBus,
    inner: Mutex<StoreInner>,
    destroyed: AtomicBool,
}

impl StateStore {
    pub fn new(bus: EventBus) -> Self {
        Self::with_state(bus, SessionState::default())
    }

    pub fn with_state(bus: EventBus, initial: SessionState) -> Self {
        Self {
            bus,
            inner: Mutex::new(StoreInner {
                current: Arc::new(initial),
                history: VecDeque::with_capacity(HISTORY_LIMIT),
            }),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Current snapshot
    pub fn state(&self) -> Arc<SessionState> {
        Arc::clone(&self.inner.lock().current)
    }

    pub fn get(&self, field: StateField) -> StateValue {
        self.inner.lock().current.get(field)
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.lock().current.is_speaking
    }

    /// Merge a patch into a new snapshot and publish the change
    ///
    /// After `destroy` this is a no-op returning the current snapshot.
    pub fn update(&self, patch: StatePatch) -> Arc<SessionState> {
        if self.destroyed.load(Ordering::Acquire) {
            return self.state();
        }

        let (old, new) = {
            let mut inner = self.inner.lock();
            let old = Arc::clone(&inner.current);
            let new = Arc::new(old.apply(&patch));
            inner.current = Arc::clone(&new);

            if inner.history.len() == HISTORY_LIMIT {
                inner.history.pop_front();
            }
            inner.history.push_back(HistoryEntry {
                timestamp: Utc::now(),
                patch: patch.clone(),
                from: Arc::clone(&old),
                to: Arc::clone(&new),
            });
            (old, new)
        };

        let changed: Vec<StateField> = StateField::ALL
            .into_iter()
            .filter(|f| old.get(*f) != new.get(*f))
            .collect();

        tracing::debug!(
            changed = ?changed.iter().map(StateField::as_str).collect::<Vec<_>>(),
            "State updated"
        );

        self.bus.emit(AppEvent::StateChanged(StateChange {
            old: Arc::clone(&old),
            new: Arc::clone(&new),
            patch,
            changed: changed.clone(),
        }));
        for field in changed {
            self.bus.emit(AppEvent::StateField(FieldChange {
                field,
                old: old.get(field),
                new: new.get(field),
            }));
        }

        new
    }

    /// Return every field to its default, through the normal update path
    pub fn reset(&self) -> Arc<SessionState> {
        self.update(StatePatch::full(&SessionState::default()))
    }

    /// Observe one field: `callback(new, old)`
    pub fn watch<F>(&self, field: StateField, callback: F) -> Subscription
    where
        F: Fn(&StateValue, &StateValue) + Send + Sync + 'static,
    {
        self.bus.on(field.topic(), move |event| {
            if let AppEvent::StateField(change) = event {
                callback(&change.new, &change.old);
            }
        })
    }

    /// Observe every update
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.bus.on(AppEvent::STATE_CHANGED, move |event| {
            if let AppEvent::StateChanged(change) = event {
                callback(change);
            }
        })
    }

    /// Recent updates, oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.lock().history.iter().cloned().collect()
    }

    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.lock().history.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("state", &self.state())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn store() -> (EventBus, StateStore) {
        let bus = EventBus::new();
        let store = StateStore::new(bus.clone());
        (bus, store)
    }

    #[test]
    fn test_initial_state() {
        let (_, store) = store();
        let state = store.state();
        assert!(!state.is_speaking);
        assert!(!state.is_connected);
        assert_eq!(state.current_audio_id, None);
        assert_eq!(store.get(StateField::Speaking), StateValue::Bool(false));
    }

    #[test]
    fn test_old_snapshots_are_never_mutated() {
        let (_, store) = store();
        let before = store.state();
        let after = store.update(StatePatch::new().speaking(true));

        assert!(!before.is_speaking);
        assert!(after.is_speaking);
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_update_emits_changed_and_field_events() {
        let (bus, store) = store();
        let changed = Arc::new(Mutex::new(Vec::new()));
        let fields = Arc::new(Mutex::new(Vec::new()));

        let c = changed.clone();
        store.on_change(move |change| c.lock().push(change.changed.clone()));
        let f = fields.clone();
        store.watch(StateField::Speaking, move |new, old| {
            f.lock().push((new.clone(), old.clone()));
        });
        let connected_hits = Arc::new(AtomicUsize::new(0));
        let h = connected_hits.clone();
        bus.on(StateField::Connected.topic(), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        // is_connected is already false: not a change
        store.update(StatePatch::new().speaking(true).connected(false));

        assert_eq!(*changed.lock(), vec![vec![StateField::Speaking]]);
        assert_eq!(
            *fields.lock(),
            vec![(StateValue::Bool(true), StateValue::Bool(false))]
        );
        assert_eq!(connected_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_noop_update_still_emits_state_changed() {
        let (_, store) = store();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        store.on_change(move |change| {
            assert!(change.changed.is_empty());
            h.fetch_add(1, Ordering::SeqCst);
        });

        store.update(StatePatch::new());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_uses_update_path() {
        let (_, store) = store();
        store.update(
            StatePatch::new()
                .speaking(true)
                .current_audio_id(Some("intro_1".into())),
        );

        let resets = Arc::new(Mutex::new(Vec::new()));
        let r = resets.clone();
        store.watch(StateField::CurrentAudioId, move |new, _| {
            r.lock().push(new.clone())
        });

        let state = store.reset();
        assert_eq!(*state, SessionState::default());
        assert_eq!(*resets.lock(), vec![StateValue::Text(None)]);
    }

    #[test]
    fn test_history_is_bounded() {
        let (_, store) = store();
        for i in 0..(HISTORY_LIMIT + 10) {
            store.update(StatePatch::new().speaking(i % 2 == 0));
        }
        let history = store.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        // the oldest retained entry is update #10, which set speaking = true
        assert_eq!(history[0].patch.is_speaking, Some(true));
    }

    #[test]
    fn test_update_after_destroy_is_noop() {
        let (_, store) = store();
        store.destroy();
        let state = store.update(StatePatch::new().speaking(true));
        assert!(!state.is_speaking);
        assert!(store.history().is_empty());
    }

    #[test]
    fn test_observer_sees_new_state_reentrantly() {
        let bus = EventBus::new();
        let store = Arc::new(StateStore::new(bus));
        let seen = Arc::new(AtomicBool::new(false));

        let s = Arc::clone(&store);
        let seen_clone = seen.clone();
        store.watch(StateField::Speaking, move |_, _| {
            seen_clone.store(s.is_speaking(), Ordering::SeqCst);
        });

        store.update(StatePatch::new().speaking(true));
        assert!(seen.load(Ordering::SeqCst));
    }
}
