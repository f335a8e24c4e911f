//! Text-to-speech backends
//!
//! - [`HttpCloudTts`]: ElevenLabs-compatible HTTP synthesis
//! - [`LocalSpeaker`]: drives an on-device [`LocalSpeechEngine`] and nudges
//!   it when an utterance never starts
//!
//! [`LocalSpeechEngine`]: avatar_core::LocalSpeechEngine

pub mod cloud;
pub mod local;

pub use cloud::HttpCloudTts;
pub use local::{LocalOutcome, LocalSpeaker, NudgePolicy};
