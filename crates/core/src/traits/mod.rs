//! Collaborator traits for the speech core
//!
//! The orchestrator never talks to a device, network, or engine directly.
//! Each outside dependency sits behind one of these traits so hosts can plug
//! in their own implementation and tests can use mocks:
//!
//! ```text
//!   - AudioPlayer: plays a clip or synthesized bytes, one at a time
//!   - CloudSpeechProvider: remote text-to-speech returning encoded audio
//!   - LocalSpeechEngine: on-device text-to-speech with lifecycle events
//! ```

mod speech;

pub use speech::{
    AudioPlayer, AudioSource, BackendKind, CloudSpeechProvider, LocalSpeechEngine,
    PlaybackOutcome, StartCallback, Utterance, UtteranceEvent,
};
