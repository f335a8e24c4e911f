//! Wire messages
//!
//! Inbound frames are JSON objects tagged by `type`. Instances of
//! [`InboundMessage`] are only produced by the validator, so their strings are
//! already sanitized and bounded.

use serde::{Deserialize, Serialize};

/// Validated inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Remote asks the avatar to speak a clip (`audioId`/`lineId`) or text
    BotSpeakingStart {
        #[serde(rename = "audioId", default, skip_serializing_if = "Option::is_none")]
        audio_id: Option<String>,
        #[serde(rename = "lineId", default, skip_serializing_if = "Option::is_none")]
        line_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Remote asks the avatar to stop
    BotSpeakingEnd,
    /// Chat text for display
    BotMessage { text: String },
    Ping,
    Pong,
    Connected,
}

impl InboundMessage {
    /// Wire `type` of the message
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::BotSpeakingStart { .. } => "bot_speaking_start",
            InboundMessage::BotSpeakingEnd => "bot_speaking_end",
            InboundMessage::BotMessage { .. } => "bot_message",
            InboundMessage::Ping => "ping",
            InboundMessage::Pong => "pong",
            InboundMessage::Connected => "connected",
        }
    }

    /// Clip id of a speaking request; `audioId` wins over `lineId`, empty
    /// strings count as absent
    pub fn clip_id(&self) -> Option<&str> {
        match self {
            InboundMessage::BotSpeakingStart {
                audio_id, line_id, ..
            } => audio_id
                .as_deref()
                .filter(|s| !s.is_empty())
                .or_else(|| line_id.as_deref().filter(|s| !s.is_empty())),
            _ => None,
        }
    }
}

/// Messages the client sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Pong,
}
