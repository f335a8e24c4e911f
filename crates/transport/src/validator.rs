//! Inbound message validation
//!
//! Every byte received from the remote peer passes through [`validate`]
//! before it can influence playback. The checks run in a fixed order and the
//! first failure is returned:
//!
//! 1. size (≤ [`MAX_FRAME_BYTES`])
//! 2. JSON syntax
//! 3. top-level object
//! 4. string `type`
//! 5. `type` in [`ALLOWED_TYPES`]
//! 6. per-type field schema
//!
//! Accepted messages have every string field sanitized.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::protocol::InboundMessage;

pub const MAX_FRAME_BYTES: usize = 65_536;
pub const MAX_TEXT_CHARS: usize = 10_000;

pub const ALLOWED_TYPES: [&str; 6] = [
    "bot_speaking_start",
    "bot_speaking_end",
    "bot_message",
    "ping",
    "pong",
    "connected",
];

static AUDIO_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,50}$").expect("audio id pattern is valid"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("frame is not valid UTF-8 text")]
    NotText,

    #[error("frame is {size} bytes, maximum is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("message must be a JSON object")]
    NotAnObject,

    #[error("message is missing a string \"type\"")]
    MissingType,

    #[error("message type not allowed: {0}")]
    TypeNotAllowed(String),

    #[error("required field missing: {0}")]
    MissingField(&'static str),

    #[error("field {0} must be a string")]
    NotAString(&'static str),

    #[error("field {0} exceeds 10000 characters")]
    TooLong(&'static str),
}

/// Validate a raw binary frame
pub fn validate_frame(frame: &[u8]) -> Result<InboundMessage, ValidationError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(ValidationError::TooLarge {
            size: frame.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let text = std::str::from_utf8(frame).map_err(|_| ValidationError::NotText)?;
    validate(text)
}

/// Validate and sanitize a text frame
pub fn validate(raw: &str) -> Result<InboundMessage, ValidationError> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(ValidationError::TooLarge {
            size: raw.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    let value: Value =
        serde_json::from_str(raw).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(ValidationError::NotAnObject);
    };

    let kind = match obj.get("type") {
        Some(Value::String(kind)) if !kind.is_empty() => kind.as_str(),
        _ => return Err(ValidationError::MissingType),
    };
    if !ALLOWED_TYPES.contains(&kind) {
        return Err(ValidationError::TypeNotAllowed(sanitize(kind)));
    }

    let message = match kind {
        "bot_speaking_start" => InboundMessage::BotSpeakingStart {
            audio_id: optional_text(&obj, "audioId")?,
            line_id: optional_text(&obj, "lineId")?,
            text: optional_text(&obj, "text")?,
        },
        "bot_speaking_end" => InboundMessage::BotSpeakingEnd,
        "bot_message" => InboundMessage::BotMessage {
            text: optional_text(&obj, "text")?.ok_or(ValidationError::MissingField("text"))?,
        },
        "ping" => InboundMessage::Ping,
        "pong" => InboundMessage::Pong,
        _ => InboundMessage::Connected,
    };
    Ok(message)
}

/// Read an optional string field; `null` counts as absent
fn optional_text(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.chars().count() > MAX_TEXT_CHARS => {
            Err(ValidationError::TooLong(field))
        }
        Some(Value::String(s)) => Ok(Some(sanitize(s))),
        Some(_) => Err(ValidationError::NotAString(field)),
    }
}

/// Strip control characters (except `\n`, `\r` and `\t`) and bound the length
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .filter(|c| matches!(*c, '\n' | '\r' | '\t') || !c.is_ascii_control())
        .take(MAX_TEXT_CHARS)
        .collect()
}

/// Clip ids are short and restricted to `[A-Za-z0-9_-]`
pub fn is_valid_audio_id(id: &str) -> bool {
    AUDIO_ID.is_match(id)
}
