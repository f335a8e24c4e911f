//! Transport layer for the avatar speech core
//!
//! - `validator`: every inbound frame is checked and sanitized here first
//! - `protocol`: typed inbound/outbound wire messages
//! - `connection`: reconnecting connection manager publishing on the bus
//! - `ws`: WebSocket connector built on tokio-tungstenite

pub mod connection;
pub mod protocol;
pub mod validator;
pub mod ws;

pub use connection::{
    Connection, ConnectionManager, ConnectionPolicy, ConnectionState, Connector, TransportEvent,
};
pub use protocol::{InboundMessage, OutboundMessage};
pub use validator::{
    is_valid_audio_id, sanitize, validate, validate_frame, ValidationError, ALLOWED_TYPES,
    MAX_FRAME_BYTES, MAX_TEXT_CHARS,
};
pub use ws::WsConnector;

use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}
