//! Domain-specific error types for the vmcast relay.
//!
//! All fallible operations return `Result<T, RelayError>`.
//! Nothing here is fatal to the process: each variant is scoped to the
//! connection, session or agent link that produced it.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A message violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A state machine was asked to make a transition it does not allow.
    #[error("invalid transition: cannot {action} while {from}")]
    InvalidTransition { from: String, action: &'static str },

    // ── Frame Errors ─────────────────────────────────────────────
    /// An agent event frame could not be parsed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// An agent frame grew past the codec limit without a delimiter.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Session Errors ───────────────────────────────────────────
    /// Offer/answer or candidate exchange failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The real-time transport reported an error.
    #[error("transport error: {0}")]
    Transport(String),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/UDP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a JSON payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for RelayError {
    fn from(s: String) -> Self {
        RelayError::Other(s)
    }
}

impl From<&str> for RelayError {
    fn from(s: &str) -> Self {
        RelayError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RelayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RelayError::ChannelClosed
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Encoding(e.to_string())
    }
}

impl From<tokio_util::codec::LinesCodecError> for RelayError {
    fn from(e: tokio_util::codec::LinesCodecError) -> Self {
        match e {
            tokio_util::codec::LinesCodecError::Io(io) => RelayError::Connection(io),
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                RelayError::ProtocolViolation("line length exceeded")
            }
        }
    }
}
