//! webrtc-rs implementation of the media transport.
//!
//! Every negotiation builds a fresh peer connection carrying a video
//! track (H.264 or VP8), an Opus audio track, a receive-only audio
//! transceiver and the `app-input` data channel. Descriptions and
//! candidates cross the signaling channel as base64-encoded JSON.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use vmcast_core::{
    Connectivity, MediaPacket, MediaTransport, NegotiationRequest, RelayError, TransportEvent,
    TransportFactory, TransportSink,
};

use crate::config::WebRtcConfig;

/// Label of the data channel carrying client input.
pub const INPUT_CHANNEL: &str = "app-input";

const STREAM_ID: &str = "vmcast";

fn transport_err(e: webrtc::Error) -> RelayError {
    RelayError::Transport(e.to_string())
}

// ── Signaling encoding ───────────────────────────────────────────

/// Serialize `value` as JSON, then base64.
pub fn encode<T: Serialize>(value: &T) -> Result<String, RelayError> {
    let json = serde_json::to_vec(value)?;
    Ok(STANDARD.encode(json))
}

pub fn decode<T: DeserializeOwned>(encoded: &str) -> Result<T, RelayError> {
    let json = STANDARD
        .decode(encoded.trim())
        .map_err(|e| RelayError::Encoding(format!("bad base64: {e}")))?;
    Ok(serde_json::from_slice(&json)?)
}

// ── Settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Vp8,
}

impl VideoCodec {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::H264 => MIME_TYPE_H264,
            Self::Vp8 => MIME_TYPE_VP8,
        }
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "h264" => Ok(Self::H264),
            "vp8" => Ok(Self::Vp8),
            other => Err(RelayError::Other(format!("unsupported video codec {other:?}"))),
        }
    }
}

/// Parse a NAT 1:1 mapping of the form `ip/candidate-type`.
pub fn parse_nat_mapping(value: &str) -> Result<(Vec<String>, RTCIceCandidateType), RelayError> {
    let Some((ip, kind)) = value.split_once('/') else {
        return Err(RelayError::Other(format!("bad NAT mapping {value:?}")));
    };
    let kind = match kind {
        "host" => RTCIceCandidateType::Host,
        "srflx" => RTCIceCandidateType::Srflx,
        "prflx" => RTCIceCandidateType::Prflx,
        "relay" => RTCIceCandidateType::Relay,
        other => return Err(RelayError::Other(format!("bad candidate type {other:?}"))),
    };
    Ok((vec![ip.to_string()], kind))
}

/// Connectivity the session cares about. `None` for intermediate states.
pub fn connectivity(state: RTCIceConnectionState) -> Option<Connectivity> {
    match state {
        RTCIceConnectionState::Checking => Some(Connectivity::Checking),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(Connectivity::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(Connectivity::Disconnected),
        RTCIceConnectionState::Failed => Some(Connectivity::Failed),
        RTCIceConnectionState::Closed => Some(Connectivity::Closed),
        _ => None,
    }
}

// ── RtcFactory ───────────────────────────────────────────────────

/// Builds a peer connection per negotiation.
#[derive(Debug, Clone)]
pub struct RtcFactory {
    ice_servers: Vec<String>,
    video_codec: VideoCodec,
    nat1to1: Option<(Vec<String>, RTCIceCandidateType)>,
    disable_interceptors: bool,
}

impl RtcFactory {
    pub fn from_config(config: &WebRtcConfig) -> Self {
        let video_codec = config.video_codec.parse().unwrap_or_else(|e| {
            warn!("{e}; using h264");
            VideoCodec::H264
        });
        let nat1to1 = if config.nat1to1.is_empty() {
            None
        } else {
            match parse_nat_mapping(&config.nat1to1) {
                Ok(mapping) => {
                    info!("using 1:1 NAT {}", config.nat1to1);
                    Some(mapping)
                }
                Err(e) => {
                    warn!("ignoring NAT mapping: {e}");
                    None
                }
            }
        };
        let ice_servers = if config.stun_turn.is_empty() {
            Vec::new()
        } else {
            vec![config.stun_turn.clone()]
        };
        Self {
            ice_servers,
            video_codec,
            nat1to1,
            disable_interceptors: config.disable_interceptors,
        }
    }

    async fn peer_connection(&self) -> Result<RTCPeerConnection, RelayError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(transport_err)?;

        let mut registry = Registry::new();
        if !self.disable_interceptors {
            registry = register_default_interceptors(registry, &mut media).map_err(transport_err)?;
        }

        let mut settings = SettingEngine::default();
        if let Some((ips, kind)) = &self.nat1to1 {
            settings.set_nat_1to1_ips(ips.clone(), *kind);
        }

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        api.new_peer_connection(config).await.map_err(transport_err)
    }
}

fn local_track(mime_type: &str, id: &str) -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        STREAM_ID.to_owned(),
    ))
}

/// Read and discard RTCP so interceptors keep working.
async fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    let mut buf = vec![0u8; 1500];
    while sender.read(&mut buf).await.is_ok() {}
}

#[async_trait]
impl TransportFactory for RtcFactory {
    async fn open(
        &self,
        request: &NegotiationRequest,
        sink: TransportSink,
    ) -> Result<Arc<dyn MediaTransport>, RelayError> {
        let pc = Arc::new(self.peer_connection().await?);
        debug!(
            "peer connection for {} client",
            if request.is_mobile { "mobile" } else { "desktop" }
        );

        let video = local_track(self.video_codec.mime_type(), "video");
        let audio = local_track(MIME_TYPE_OPUS, "audio");
        for track in [&video, &audio] {
            let track: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(track) as _;
            let sender = pc.add_track(track).await.map_err(transport_err)?;
            tokio::spawn(drain_rtcp(sender));
        }
        pc.add_transceiver_from_kind(
            RTPCodecType::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(transport_err)?;

        let channel = pc
            .create_data_channel(INPUT_CHANNEL, None)
            .await
            .map_err(transport_err)?;
        let inbound = sink.inbound.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let inbound = inbound.clone();
            Box::pin(async move {
                if inbound.send(msg.data).await.is_err() {
                    trace!("input message after session end");
                }
            })
        }));

        let events = sink.events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                debug!("ice connection {state}");
                if let Some(state) = connectivity(state) {
                    let _ = events.send(TransportEvent::Connectivity(state)).await;
                }
            })
        }));

        let events = sink.events;
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let encoded = match candidate {
                    Some(candidate) => {
                        match candidate.to_json().map_err(transport_err).and_then(|c| encode(&c)) {
                            Ok(encoded) => Some(encoded),
                            Err(e) => {
                                warn!("cannot encode local candidate: {e}");
                                return;
                            }
                        }
                    }
                    None => None,
                };
                let _ = events.send(TransportEvent::LocalCandidate(encoded)).await;
            })
        }));

        Ok(Arc::new(RtcTransport { pc, video, audio }))
    }
}

// ── RtcTransport ─────────────────────────────────────────────────

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    video: Arc<TrackLocalStaticRTP>,
    audio: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn create_offer(&self) -> Result<String, RelayError> {
        let offer = self.pc.create_offer(None).await.map_err(transport_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(transport_err)?;
        encode(&offer)
    }

    async fn set_remote_description(&self, encoded: &str) -> Result<(), RelayError> {
        let answer: RTCSessionDescription = decode(encoded)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(transport_err)
    }

    async fn add_remote_candidate(&self, encoded: &str) -> Result<(), RelayError> {
        let candidate: RTCIceCandidateInit = decode(encoded)?;
        trace!("remote candidate {}", candidate.candidate);
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(transport_err)
    }

    async fn write_video(&self, packet: &MediaPacket) -> Result<(), RelayError> {
        self.video
            .write(&packet.data)
            .await
            .map(|_| ())
            .map_err(transport_err)
    }

    async fn write_audio(&self, packet: &MediaPacket) -> Result<(), RelayError> {
        self.audio
            .write(&packet.data)
            .await
            .map(|_| ())
            .map_err(transport_err)
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.pc.close().await.map_err(transport_err)
    }
}

// ── Tests ────────────────────────────────────────────────────────
