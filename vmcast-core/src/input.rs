//! Input events submitted by browser clients.
//!
//! Clients send input as envelopes, over the data channel or the
//! signaling socket, with JSON payloads:
//!
//! ```text
//! KEYDOWN / KEYUP                    {"keycode": 65}
//! MOUSEMOVE / MOUSEDOWN / MOUSEUP    {"isLeft": 1, "x": 10.0, "y": 20.0, "width": 1280, "height": 720}
//! ```

use serde::{Deserialize, Deserializer};

use crate::codec::frame::AgentFrame;
use crate::codec::{KeyEvent, KeyState, PointerButton, PointerEvent, PointerState, ScreenSize};
use crate::envelope::{Envelope, kinds};
use crate::error::RelayError;

/// A decoded client input event, still in client viewport space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Key(KeyEvent),
    Pointer(PointerEvent),
}

#[derive(Deserialize)]
struct KeyPayload {
    keycode: u32,
}

#[derive(Deserialize)]
struct PointerPayload {
    #[serde(rename = "isLeft", default, deserialize_with = "flag")]
    is_left: bool,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

/// Browsers send `isLeft` as either a number or a boolean.
fn flag<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    match serde_json::Value::deserialize(de)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        _ => Err(serde::de::Error::custom("isLeft must be a bool or number")),
    }
}

impl InputEvent {
    /// Decode an input envelope.
    ///
    /// Returns `Ok(None)` for kinds that are not input events.
    pub fn from_envelope(env: &Envelope) -> Result<Option<Self>, RelayError> {
        let event = match env.kind.as_str() {
            kinds::KEY_DOWN => Self::key(&env.payload, KeyState::Pressed)?,
            kinds::KEY_UP => Self::key(&env.payload, KeyState::Released)?,
            kinds::MOUSE_MOVE => Self::pointer(&env.payload, PointerState::Move)?,
            kinds::MOUSE_DOWN => Self::pointer(&env.payload, PointerState::Down)?,
            kinds::MOUSE_UP => Self::pointer(&env.payload, PointerState::Up)?,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Decode a raw data-channel message, which carries a JSON envelope.
    pub fn from_datagram(data: &[u8]) -> Result<Option<Self>, RelayError> {
        let env: Envelope = serde_json::from_slice(data)?;
        Self::from_envelope(&env)
    }

    fn key(payload: &str, state: KeyState) -> Result<Self, RelayError> {
        let p: KeyPayload = serde_json::from_str(payload)?;
        Ok(Self::Key(KeyEvent::new(p.keycode, state)))
    }

    fn pointer(payload: &str, state: PointerState) -> Result<Self, RelayError> {
        let p: PointerPayload = serde_json::from_str(payload)?;
        Ok(Self::Pointer(PointerEvent {
            button: if p.is_left {
                PointerButton::Left
            } else {
                PointerButton::Right
            },
            state,
            x: p.x,
            y: p.y,
            width: p.width,
            height: p.height,
        }))
    }

    /// Convert to the agent frame, rescaling pointer coordinates onto
    /// the agent's screen.
    pub fn into_frame(self, screen: ScreenSize) -> Result<AgentFrame, RelayError> {
        match self {
            Self::Key(ev) => Ok(AgentFrame::Key(ev)),
            Self::Pointer(ev) => Ok(AgentFrame::Pointer(ev.rescale(screen)?)),
        }
    }
}
