//! Media packets as they arrive from the capture pipeline.
//!
//! ## RTP fixed header (RFC 3550)
//! ```text
//! byte 0:      V(2) P(1) X(1) CC(4)
//! byte 1:      M(1) PT(7)
//! bytes 2..4:  sequence number   (u16, big-endian)
//! bytes 4..8:  timestamp         (u32, big-endian)
//! bytes 8..12: SSRC              (u32, big-endian)
//! ```

use std::fmt;

use bytes::Bytes;

use crate::error::RelayError;

/// Size of the RTP fixed header.
pub const RTP_HEADER_SIZE: usize = 12;

const RTP_VERSION: u8 = 2;

/// Which upstream stream a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// One timestamped RTP packet. Cloning shares the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub kind: MediaKind,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// The full RTP packet, header included.
    pub data: Bytes,
}

impl MediaPacket {
    /// Validate the RTP fixed header and wrap the datagram.
    pub fn parse(kind: MediaKind, data: Bytes) -> Result<Self, RelayError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(RelayError::MalformedFrame(format!(
                "rtp packet too short: {} < {RTP_HEADER_SIZE}",
                data.len()
            )));
        }
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RelayError::MalformedFrame(format!(
                "unsupported rtp version {version}"
            )));
        }
        Ok(Self {
            kind,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data,
        })
    }
}

#[cfg(test)]
pub(crate) fn rtp_fixture(sequence: u16, timestamp: u32, ssrc: u32, payload: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(RTP_HEADER_SIZE + payload.len());
    buf.push(0x80);
    buf.push(96);
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(&ssrc.to_be_bytes());
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}
