//! The seam between a media session and its real-time transport.
//!
//! A [`TransportFactory`] opens one [`MediaTransport`] per negotiation.
//! The transport reports candidates and connectivity through the
//! [`TransportSink`] it is given and delivers inbound data-channel
//! messages on the sink's `inbound` queue.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::broadcast::MediaPacket;
use crate::error::RelayError;

/// Connectivity as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl Connectivity {
    /// States that end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Something the transport wants the session to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate, encoded for the signaling channel. `None`
    /// marks the end of gathering.
    LocalCandidate(Option<String>),
    Connectivity(Connectivity),
}

/// Queues a transport reports into.
#[derive(Debug, Clone)]
pub struct TransportSink {
    pub events: mpsc::Sender<TransportEvent>,
    /// Raw data-channel messages from the client.
    pub inbound: mpsc::Sender<Bytes>,
}

/// Payload of a negotiation-init request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NegotiationRequest {
    #[serde(default)]
    pub is_mobile: bool,
}

impl NegotiationRequest {
    /// Parse the request payload. An empty payload means defaults.
    pub fn parse(payload: &str) -> Result<Self, RelayError> {
        if payload.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(payload)?)
    }
}

/// One negotiated real-time transport.
///
/// Descriptions and candidates cross this boundary in their
/// signaling-channel encoding.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Attach tracks, create the local description and return it encoded.
    async fn create_offer(&self) -> Result<String, RelayError>;

    async fn set_remote_description(&self, encoded: &str) -> Result<(), RelayError>;

    async fn add_remote_candidate(&self, encoded: &str) -> Result<(), RelayError>;

    async fn write_video(&self, packet: &MediaPacket) -> Result<(), RelayError>;

    async fn write_audio(&self, packet: &MediaPacket) -> Result<(), RelayError>;

    async fn close(&self) -> Result<(), RelayError>;
}

/// Opens transports for sessions.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        request: &NegotiationRequest,
        sink: TransportSink,
    ) -> Result<Arc<dyn MediaTransport>, RelayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_request_parsing() {
        assert!(!NegotiationRequest::parse("").unwrap().is_mobile);
        assert!(!NegotiationRequest::parse(r#"{"is_mobile":false}"#).unwrap().is_mobile);
        assert!(NegotiationRequest::parse(r#"{"is_mobile":true}"#).unwrap().is_mobile);
        assert!(NegotiationRequest::parse("{").is_err());
    }

    #[test]
    fn terminal_connectivity() {
        assert!(Connectivity::Failed.is_terminal());
        assert!(Connectivity::Disconnected.is_terminal());
        assert!(Connectivity::Closed.is_terminal());
        assert!(!Connectivity::Connected.is_terminal());
        assert!(!Connectivity::Checking.is_terminal());
    }
}
