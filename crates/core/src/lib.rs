//! Core types for the avatar speech core
//!
//! This crate provides the foundation shared by every other crate:
//! - Event bus for in-process publish/subscribe
//! - Immutable session state store
//! - Catalog types for pre-recorded clips
//! - Collaborator traits (audio player, cloud and local speech)
//! - Backoff math and error types

pub mod backoff;
pub mod catalog;
pub mod error;
pub mod events;
pub mod state;
pub mod traits;

pub use backoff::Backoff;
pub use catalog::{Catalog, CatalogEntry, Segment};
pub use error::{CloudTtsError, Error, PlaybackError, Result, SpeechEngineError};
pub use events::{AppEvent, EventBus, Handler, Subscription, SubscriptionId};
pub use state::{
    FieldChange, HistoryEntry, SessionState, StateChange, StateField, StatePatch, StateStore,
    StateValue, HISTORY_LIMIT,
};

pub use traits::{
    AudioPlayer, AudioSource, BackendKind, CloudSpeechProvider, LocalSpeechEngine,
    PlaybackOutcome, StartCallback, Utterance, UtteranceEvent,
};
