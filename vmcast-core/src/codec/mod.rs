//! Event codec for the agent line protocol.
//!
//! ## Frame alphabet
//!
//! ```text
//! keepalive:  0x00
//! key:        K<code>,<state>|                       state: 1 pressed, 0 released
//! pointer:    M<button>,<state>,<x>,<y>,<w>,<h>|     state: 0 move, 1 down, 2 up
//! ```
//!
//! Pointer coordinates are floats in the client's viewport space and are
//! rescaled to the agent's screen before encoding. `w`/`h` keep the
//! client's reported viewport.
//!
//! Decoding demands the exact field count and fails with
//! [`RelayError::MalformedFrame`] otherwise. Callers drop the event.

pub mod frame;

use std::fmt;

use crate::error::RelayError;

pub use frame::{AgentCodec, AgentFrame};

/// Terminates every event frame.
pub const FRAME_DELIMITER: u8 = b'|';

/// The keepalive byte.
pub const KEEPALIVE_BYTE: u8 = 0;

const KEY_TAG: char = 'K';
const POINTER_TAG: char = 'M';

// ── KeyState ─────────────────────────────────────────────────────

/// Whether a key went down or up.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    Released = 0,
    Pressed = 1,
}

impl TryFrom<u8> for KeyState {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyState::Released),
            1 => Ok(KeyState::Pressed),
            _ => Err(RelayError::UnknownVariant {
                type_name: "KeyState",
                value: value as u64,
            }),
        }
    }
}

// ── PointerState ─────────────────────────────────────────────────

/// What a pointer event did.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerState {
    Move = 0,
    Down = 1,
    Up = 2,
}

impl TryFrom<u8> for PointerState {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PointerState::Move),
            1 => Ok(PointerState::Down),
            2 => Ok(PointerState::Up),
            _ => Err(RelayError::UnknownVariant {
                type_name: "PointerState",
                value: value as u64,
            }),
        }
    }
}

// ── PointerButton ────────────────────────────────────────────────

/// Which button a pointer event refers to. Encoded as the client's
/// `isLeft` flag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerButton {
    Right = 0,
    Left = 1,
}

impl TryFrom<u8> for PointerButton {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PointerButton::Right),
            1 => Ok(PointerButton::Left),
            _ => Err(RelayError::UnknownVariant {
                type_name: "PointerButton",
                value: value as u64,
            }),
        }
    }
}

// ── ScreenSize ───────────────────────────────────────────────────

/// Pixel dimensions of the agent's screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for ScreenSize {
    fn default() -> Self {
        Self::new(800, 600)
    }
}

impl fmt::Display for ScreenSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ── Events ───────────────────────────────────────────────────────

/// A key press or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: u32,
    pub state: KeyState,
}

impl KeyEvent {
    pub fn new(code: u32, state: KeyState) -> Self {
        Self { code, state }
    }
}

/// A pointer move, press or release.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerEvent {
    pub button: PointerButton,
    pub state: PointerState,
    pub x: f64,
    pub y: f64,
    /// Viewport width the coordinates were reported in.
    pub width: f64,
    /// Viewport height the coordinates were reported in.
    pub height: f64,
}

impl PointerEvent {
    /// Map the coordinates from the client's viewport onto `screen`:
    /// `x' = x * screen.width / width`, likewise for `y`.
    ///
    /// Fails when the reported viewport has no area.
    pub fn rescale(self, screen: ScreenSize) -> Result<Self, RelayError> {
        if !(self.width > 0.0 && self.height > 0.0) {
            return Err(RelayError::MalformedFrame(format!(
                "pointer viewport {}x{} has no area",
                self.width, self.height
            )));
        }
        Ok(Self {
            x: self.x * screen.width as f64 / self.width,
            y: self.y * screen.height as f64 / self.height,
            ..self
        })
    }
}

// ── Encoding ─────────────────────────────────────────────────────

/// Encode a key event as `K<code>,<state>|`.
pub fn encode_key(event: &KeyEvent) -> Vec<u8> {
    format!("{KEY_TAG}{},{}|", event.code, event.state as u8).into_bytes()
}

/// Encode a pointer event as `M<button>,<state>,<x>,<y>,<w>,<h>|`.
pub fn encode_pointer(event: &PointerEvent) -> Vec<u8> {
    format!(
        "{POINTER_TAG}{},{},{:.6},{:.6},{:.6},{:.6}|",
        event.button as u8, event.state as u8, event.x, event.y, event.width, event.height
    )
    .into_bytes()
}

// ── Decoding ─────────────────────────────────────────────────────

/// Decode a key frame. The trailing delimiter is optional.
pub fn decode_key(frame: &[u8]) -> Result<KeyEvent, RelayError> {
    let fields = split_fields(frame, KEY_TAG, 2)?;
    let code = parse_field::<u32>(fields[0], "key code")?;
    let state = KeyState::try_from(parse_field::<u8>(fields[1], "key state")?)
        .map_err(|e| RelayError::MalformedFrame(e.to_string()))?;
    Ok(KeyEvent { code, state })
}

/// Decode a pointer frame. The trailing delimiter is optional.
pub fn decode_pointer(frame: &[u8]) -> Result<PointerEvent, RelayError> {
    let fields = split_fields(frame, POINTER_TAG, 6)?;
    let button = PointerButton::try_from(parse_field::<u8>(fields[0], "pointer button")?)
        .map_err(|e| RelayError::MalformedFrame(e.to_string()))?;
    let state = PointerState::try_from(parse_field::<u8>(fields[1], "pointer state")?)
        .map_err(|e| RelayError::MalformedFrame(e.to_string()))?;
    Ok(PointerEvent {
        button,
        state,
        x: parse_field(fields[2], "x")?,
        y: parse_field(fields[3], "y")?,
        width: parse_field(fields[4], "width")?,
        height: parse_field(fields[5], "height")?,
    })
}

fn split_fields(frame: &[u8], tag: char, expected: usize) -> Result<Vec<&str>, RelayError> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| RelayError::MalformedFrame("frame is not utf-8".into()))?;
    let text = text.strip_suffix(FRAME_DELIMITER as char).unwrap_or(text);
    let body = text
        .strip_prefix(tag)
        .ok_or_else(|| RelayError::MalformedFrame(format!("expected '{tag}' frame")))?;

    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() != expected {
        return Err(RelayError::MalformedFrame(format!(
            "'{tag}' frame has {} fields, expected {expected}",
            fields.len()
        )));
    }
    Ok(fields)
}

fn parse_field<T: std::str::FromStr>(field: &str, name: &str) -> Result<T, RelayError> {
    field
        .trim()
        .parse()
        .map_err(|_| RelayError::MalformedFrame(format!("bad {name}: {field:?}")))
}

// ── Tests ────────────────────────────────────────────────────────
