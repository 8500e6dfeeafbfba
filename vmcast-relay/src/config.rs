//! Configuration for the relay service.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vmcast_core::{AgentConfig, ProtocolConfig, ScreenSize, SessionConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub network: NetworkConfig,
    /// The application being streamed.
    pub app: AppConfig,
    pub webrtc: WebRtcConfig,
    pub protocol: ProtocolSettings,
    pub session: SessionSettings,
    pub agent: AgentSettings,
    pub capture: CaptureConfig,
    pub discovery: DiscoveryConfig,
    pub logging: LoggingConfig,
}

/// Listening addresses and ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address of the browser-facing HTTP/websocket endpoint.
    pub http_addr: String,
    /// TCP port the injection agent dials.
    pub agent_port: u16,
    /// Loopback UDP port receiving video RTP from the capture pipeline.
    pub video_rtp_port: u16,
    /// Loopback UDP port receiving audio RTP.
    pub audio_rtp_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub page_title: String,
    /// `ondemand` or `collaborative`.
    pub mode: String,
    pub screen_width: u32,
    pub screen_height: u32,
    /// Address advertised to the discovery registry.
    pub instance_addr: String,
    pub has_chat: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN/TURN server URL handed to clients and the local agent.
    pub stun_turn: String,
    /// `h264` or `vp8`.
    pub video_codec: String,
    /// NAT 1:1 mapping as `ip/candidate-type`, e.g. `203.0.113.7/srflx`.
    pub nat1to1: String,
    /// Skip the default RTCP interceptors.
    pub disable_interceptors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    pub heartbeat_interval_ms: u64,
    pub write_timeout_ms: u64,
    /// Silence tolerated from a client. `0` disables the deadline.
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub queue_capacity: usize,
    pub renegotiate_delay_ms: u64,
    /// Shared queue between every session and the agent relay.
    pub input_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub keepalive_ms: u64,
    pub write_timeout_ms: u64,
}

/// Receive buffer pool for captured RTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub pool_slots: usize,
    pub slot_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Base URL of the registry. Empty disables discovery.
    pub host: String,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".into(),
            agent_port: 9090,
            video_rtp_port: 5004,
            audio_rtp_port: 4004,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "app".into(),
            page_title: String::new(),
            mode: "ondemand".into(),
            screen_width: 800,
            screen_height: 600,
            instance_addr: String::new(),
            has_chat: false,
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_turn: "stun:stun.l.google.com:19302".into(),
            video_codec: "h264".into(),
            nat1to1: String::new(),
            disable_interceptors: false,
        }
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            write_timeout_ms: 20_000,
            read_timeout_ms: 20_000,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 30,
            renegotiate_delay_ms: 2000,
            input_queue_capacity: 100,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            keepalive_ms: 10_000,
            write_timeout_ms: 2000,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pool_slots: vmcast_core::broadcast::DEFAULT_SLOTS,
            slot_size: vmcast_core::broadcast::DEFAULT_SLOT_SIZE,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            poll_interval_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl RelayConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn http_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.network.http_addr.parse()
    }

    pub fn agent_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.network.agent_port))
    }

    /// Capture sockets only ever listen on loopback.
    pub fn video_rtp_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.network.video_rtp_port))
    }

    pub fn audio_rtp_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.network.audio_rtp_port))
    }

    pub fn screen(&self) -> ScreenSize {
        ScreenSize::new(self.app.screen_width, self.app.screen_height)
    }

    pub fn to_protocol_config(&self) -> ProtocolConfig {
        let p = &self.protocol;
        ProtocolConfig {
            heartbeat_interval: Duration::from_millis(p.heartbeat_interval_ms.max(1)),
            write_timeout: Duration::from_millis(p.write_timeout_ms),
            read_timeout: (p.read_timeout_ms > 0).then(|| Duration::from_millis(p.read_timeout_ms)),
        }
    }

    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            queue_capacity: self.session.queue_capacity.max(1),
            renegotiate_delay: Duration::from_millis(self.session.renegotiate_delay_ms),
            ..SessionConfig::default()
        }
    }

    pub fn to_agent_config(&self) -> AgentConfig {
        AgentConfig {
            keepalive: Duration::from_millis(self.agent.keepalive_ms.max(2)),
            write_timeout: Duration::from_millis(self.agent.write_timeout_ms),
            screen: self.screen(),
        }
    }

    pub fn discovery_enabled(&self) -> bool {
        !self.discovery.host.trim().is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────
