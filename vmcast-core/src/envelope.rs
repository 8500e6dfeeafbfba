//! The wire envelope carried over the browser signaling channel.
//!
//! Each frame is one JSON object:
//!
//! ```text
//! { "type": "<kind>", "data": "<payload>", "packet_id": "<correlation id>", "session_id": "<id>" }
//! ```
//!
//! `packet_id` is assigned by whoever sends a request and echoed verbatim
//! by the responder. `session_id` tags the remote client a message belongs
//! to when it is relayed across an intermediary.

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

// ── Kinds ────────────────────────────────────────────────────────

/// Message kinds understood by the relay.
pub mod kinds {
    /// Periodic keepalive, server → client.
    pub const HEARTBEAT: &str = "heartbeat";
    /// ICE server list, sent once when a client connects.
    pub const ICE_CONFIG: &str = "init";
    /// Application metadata, sent once when a client connects.
    pub const APP_META: &str = "INIT";
    /// Client asks the server to start a media negotiation.
    pub const INIT_WEBRTC: &str = "initwebrtc";
    /// Server's local description, the reply to `initwebrtc`.
    pub const OFFER: &str = "offer";
    /// Client's remote description.
    pub const ANSWER: &str = "answer";
    /// Trickle candidate, both directions.
    pub const CANDIDATE: &str = "candidate";

    pub const KEY_DOWN: &str = "KEYDOWN";
    pub const KEY_UP: &str = "KEYUP";
    pub const MOUSE_MOVE: &str = "MOUSEMOVE";
    pub const MOUSE_DOWN: &str = "MOUSEDOWN";
    pub const MOUSE_UP: &str = "MOUSEUP";

    /// Every input kind, in registration order.
    pub const INPUT: [&str; 5] = [KEY_DOWN, KEY_UP, MOUSE_MOVE, MOUSE_DOWN, MOUSE_UP];
}

// ── Envelope ─────────────────────────────────────────────────────

/// One protocol message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "data", default)]
    pub payload: String,
    #[serde(rename = "packet_id", default)]
    pub correlation_id: String,
    #[serde(default)]
    pub session_id: String,
}

impl Envelope {
    /// Build an envelope with a kind and payload and no ids.
    pub fn new(kind: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// The "no reply" marker. Handlers return this to suppress a reply.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Returns `true` for the no-op marker. Such an envelope is never
    /// written to the wire.
    pub fn is_noop(&self) -> bool {
        self.kind.is_empty()
            && self.payload.is_empty()
            && self.correlation_id.is_empty()
            && self.session_id.is_empty()
    }

    /// Set the session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Stamp `self` as the reply to `request`, copying its ids.
    pub fn in_reply_to(mut self, request: &Envelope) -> Self {
        self.correlation_id = request.correlation_id.clone();
        self.session_id = request.session_id.clone();
        self
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame.
    pub fn from_json(frame: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(frame)?)
    }
}
