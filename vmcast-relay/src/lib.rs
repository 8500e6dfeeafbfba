//! # vmcast-relay: Session Relay Service
//!
//! Streams a legacy desktop application to browsers. Captured RTP
//! arrives on loopback UDP and is fanned out to every browser session
//! over WebRTC. Browser input travels back over the signaling socket or
//! the session's data channel and is relayed to the injection agent.
//!
//! ## Endpoints
//!
//! - **`/ws`**: websocket carrying JSON envelopes (signaling and input).
//! - **Agent port**: TCP, the injection agent dials in.
//! - **RTP ports**: loopback UDP, video and audio from the capture pipeline.

pub mod config;
pub mod discovery;
pub mod rtc;
pub mod service;
pub mod ws;
