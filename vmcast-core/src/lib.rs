//! # vmcast-core
//!
//! Session relay core for streaming an isolated application to browsers.
//!
//! This crate contains:
//! - **Envelope & protocol**: `Envelope`, `PacketClient` with correlated replies, routes and heartbeat
//! - **Session**: `MediaSession` and its `SessionPhase` state machine over a pluggable `MediaTransport`
//! - **Broadcast**: `Broadcaster` fanning captured RTP out to every live session
//! - **Capture**: `RtpListener` reading the capture pipeline's RTP into pooled buffers
//! - **Agent**: `AgentRelay` and `AgentClient` for the input-injection agent socket
//! - **Codec**: `K`/`M` agent frames and `AgentCodec` for `tokio_util`
//! - **Error**: `RelayError`, a `thiserror`-based error type

pub mod agent;
pub mod broadcast;
pub mod capture;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod input;
pub mod protocol;
pub mod queue;
pub mod relay;
pub mod session;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use agent::{AgentClient, AgentConfig, AgentRelay, Readiness};
pub use broadcast::{Broadcaster, FanoutHandle, MediaKind, MediaPacket, PacketPool, Subscriber};
pub use capture::RtpListener;
pub use codec::{
    AgentCodec, AgentFrame, KeyEvent, KeyState, PointerButton, PointerEvent, PointerState,
    ScreenSize,
};
pub use envelope::{Envelope, kinds};
pub use error::RelayError;
pub use input::InputEvent;
pub use protocol::{PacketClient, ProtocolConfig, line_transport};
pub use queue::{Delivery, OutputQueue};
pub use relay::{ClientConnection, Relay};
pub use session::{
    Connectivity, MediaSession, MediaTransport, NegotiationRequest, SessionConfig, SessionPhase,
    TransportEvent, TransportFactory, TransportSink,
};
