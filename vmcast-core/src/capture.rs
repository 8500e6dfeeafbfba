//! UDP listeners for the external capture pipeline's RTP output.
//!
//! The capture pipeline pushes RTP for video and audio to two loopback
//! ports. Each listener reads datagrams into [`PacketPool`] slots and
//! forwards them as [`MediaPacket`]s. Read errors and malformed
//! datagrams are logged and skipped.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{MediaKind, MediaPacket, PacketPool};
use crate::error::RelayError;

/// Packets buffered between a listener and its fan-out loop.
const FORWARD_QUEUE: usize = 256;

/// Reads one RTP stream from a UDP socket.
#[derive(Debug)]
pub struct RtpListener {
    kind: MediaKind,
    socket: UdpSocket,
    pool: PacketPool,
}

impl RtpListener {
    /// Bind the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        kind: MediaKind,
        pool: PacketPool,
    ) -> Result<Self, RelayError> {
        let socket = UdpSocket::bind(addr).await?;
        info!("{kind} rtp listening on {}", socket.local_addr()?);
        Ok(Self { kind, socket, pool })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.socket.local_addr()?)
    }

    /// Start reading. Returns the packet stream for the fan-out loop.
    pub fn spawn(
        self,
        shutdown: CancellationToken,
    ) -> (ReceiverStream<MediaPacket>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(FORWARD_QUEUE);
        let task = tokio::spawn(self.run(tx, shutdown));
        (ReceiverStream::new(rx), task)
    }

    async fn run(mut self, tx: mpsc::Sender<MediaPacket>, shutdown: CancellationToken) {
        let mut ssrc = None;
        loop {
            let slot = self.pool.next_slot();
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = self.socket.recv_buf_from(slot) => read,
            };
            if let Err(e) = read {
                warn!("{} rtp read failed: {e}", self.kind);
                continue;
            }

            let data = PacketPool::take(slot);
            let packet = match MediaPacket::parse(self.kind, data) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("{} rtp datagram skipped: {e}", self.kind);
                    continue;
                }
            };

            if ssrc.is_none() {
                info!("{} stream ssrc {:#010x}", self.kind, packet.ssrc);
                ssrc = Some(packet.ssrc);
            }

            if tx.send(packet).await.is_err() {
                debug!("{} fan-out gone, listener stopping", self.kind);
                break;
            }
        }
    }
}
