//! Media session lifecycle.
//!
//! Provides a `SessionPhase` enum with validated transitions that return
//! `Result` instead of panicking.

use std::time::Instant;

use crate::error::RelayError;

// ── SessionPhase ─────────────────────────────────────────────────

/// Where a media session is in its lifecycle.
///
/// ```text
///  Idle ──► Negotiating ──► Connected ──► Streaming
///   │         ▲    │            │             │
///   │         └────┴────────────┴─────────────┘   renegotiation
///   │              │            │             │
///   └──────────────┴────────────┴─────────────┴──► Closed
/// ```
///
/// Any failure routes straight to `Closed`, which is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// Created; no transport yet.
    #[default]
    Idle,

    /// Local description offered; waiting for the remote description.
    Negotiating,

    /// Remote description applied; waiting for transport connectivity.
    Connected,

    /// Transport connected; forwarding loops running.
    Streaming {
        /// When streaming started.
        since: Instant,
    },

    /// Torn down. Terminal.
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Negotiating => write!(f, "Negotiating"),
            Self::Connected => write!(f, "Connected"),
            Self::Streaming { .. } => write!(f, "Streaming"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl SessionPhase {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Remote candidates are accepted once negotiation has begun.
    pub fn accepts_candidates(&self) -> bool {
        matches!(
            self,
            Self::Negotiating | Self::Connected | Self::Streaming { .. }
        )
    }

    /// How long the session has been streaming, if it is.
    pub fn streaming_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Streaming { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    fn invalid(&self, action: &'static str) -> RelayError {
        RelayError::InvalidTransition {
            from: self.to_string(),
            action,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Negotiating`.
    ///
    /// Valid from: every state except `Closed`. From a later state this
    /// is a renegotiation and the caller tears the old transport down.
    pub fn begin_negotiation(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Closed => Err(self.invalid("negotiate")),
            _ => {
                *self = Self::Negotiating;
                Ok(())
            }
        }
    }

    /// Transition to `Connected`.
    ///
    /// Valid from: `Negotiating`.
    pub fn apply_remote_description(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Negotiating => {
                *self = Self::Connected;
                Ok(())
            }
            _ => Err(self.invalid("apply remote description")),
        }
    }

    /// Transition to `Streaming`.
    ///
    /// Valid from: `Connected`.
    pub fn begin_streaming(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Connected => {
                *self = Self::Streaming {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(self.invalid("start streaming")),
        }
    }

    /// Transition to `Closed` from any state.
    ///
    /// Returns `false` when the session was already closed.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        *self = Self::Closed;
        true
    }
}

// ── Tests ────────────────────────────────────────────────────────
