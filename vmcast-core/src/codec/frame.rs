//! `tokio_util` codec for the agent socket.
//!
//! Keepalives are a lone zero byte; every other frame runs up to the
//! next `|`. Frames that fail to parse are dropped here so one bad frame
//! never tears down the stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::{
    FRAME_DELIMITER, KEEPALIVE_BYTE, KeyEvent, PointerEvent, decode_key, decode_pointer,
    encode_key, encode_pointer,
};
use crate::error::RelayError;

/// Longest event frame accepted before the delimiter.
pub const MAX_FRAME_SIZE: usize = 1024;

/// One unit on the agent socket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AgentFrame {
    Keepalive,
    Key(KeyEvent),
    Pointer(PointerEvent),
}

/// Frames [`AgentFrame`]s over a byte stream.
#[derive(Debug, Default)]
pub struct AgentCodec;

impl Decoder for AgentCodec {
    type Item = AgentFrame;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(&first) = src.first() else {
                return Ok(None);
            };

            if first == KEEPALIVE_BYTE {
                src.advance(1);
                return Ok(Some(AgentFrame::Keepalive));
            }

            let Some(end) = src.iter().position(|b| *b == FRAME_DELIMITER) else {
                if src.len() > MAX_FRAME_SIZE {
                    return Err(RelayError::FrameTooLarge {
                        size: src.len(),
                        max: MAX_FRAME_SIZE,
                    });
                }
                return Ok(None);
            };

            let raw = src.split_to(end + 1);
            let parsed = match first {
                b'K' => decode_key(&raw).map(AgentFrame::Key),
                b'M' => decode_pointer(&raw).map(AgentFrame::Pointer),
                _ => Err(RelayError::MalformedFrame(format!(
                    "unknown frame tag {:#x}",
                    first
                ))),
            };

            match parsed {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => debug!("dropping agent frame: {e}"),
            }
        }
    }
}

impl Encoder<AgentFrame> for AgentCodec {
    type Error = RelayError;

    fn encode(&mut self, item: AgentFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            AgentFrame::Keepalive => dst.put_u8(KEEPALIVE_BYTE),
            AgentFrame::Key(ev) => dst.extend_from_slice(&encode_key(&ev)),
            AgentFrame::Pointer(ev) => dst.extend_from_slice(&encode_pointer(&ev)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{KeyState, PointerButton, PointerState};

    #[test]
    fn decodes_mixed_stream() {
        let mut codec = AgentCodec;
        let mut buf = BytesMut::from(&b"\0K65,1|\0M1,0,1.5,2.5,100.0,50.0|"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(AgentFrame::Keepalive));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(AgentFrame::Key(KeyEvent::new(65, KeyState::Pressed)))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(AgentFrame::Keepalive));
        match codec.decode(&mut buf).unwrap() {
            Some(AgentFrame::Pointer(p)) => {
                assert_eq!(p.button, PointerButton::Left);
                assert_eq!(p.state, PointerState::Move);
                assert_eq!(p.x, 1.5);
            }
            other => panic!("expected pointer, got {other:?}"),
        }
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn partial_frame_waits() {
        let mut codec = AgentCodec;
        let mut buf = BytesMut::from(&b"K65"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b",0|");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(AgentFrame::Key(KeyEvent::new(65, KeyState::Released)))
        );
    }

    #[test]
    fn malformed_frame_is_skipped() {
        let mut codec = AgentCodec;
        let mut buf = BytesMut::from(&b"K65|Xjunk|K66,1|"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(AgentFrame::Key(KeyEvent::new(66, KeyState::Pressed)))
        );
    }

    #[test]
    fn oversized_frame_errors() {
        let mut codec = AgentCodec;
        let mut buf = BytesMut::from(&vec![b'K'; MAX_FRAME_SIZE + 1][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RelayError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn encodes_keepalive_and_key() {
        let mut codec = AgentCodec;
        let mut dst = BytesMut::new();
        codec.encode(AgentFrame::Keepalive, &mut dst).unwrap();
        codec
            .encode(AgentFrame::Key(KeyEvent::new(65, KeyState::Pressed)), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], b"\0K65,1|");
    }
}
