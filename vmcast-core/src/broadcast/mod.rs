//! Fan-out of the upstream video and audio streams to live sessions.
//!
//! Each stream gets its own loop that exclusively owns a registry of
//! subscribers. Sessions join and leave by sending control messages to
//! that loop; nothing else touches the registry.
//!
//! ```text
//!   capture ──► fan-out loop ──try_push──► session A image queue
//!                  ▲   │      ──try_push──► session B image queue (full: dropped)
//!   join/leave ────┘   └─ cancelled session: removed, queue closed
//! ```
//!
//! Delivery never waits. A full queue drops the packet for that
//! subscriber only.

pub mod packet;
pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::RelayError;
use crate::queue::{Delivery, OutputQueue};

pub use packet::{MediaKind, MediaPacket, RTP_HEADER_SIZE};
pub use pool::{DEFAULT_SLOT_SIZE, DEFAULT_SLOTS, PacketPool};

const CONTROL_QUEUE: usize = 64;

// ── Subscriber ───────────────────────────────────────────────────

/// One session's output queue for one stream.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub queue: Arc<OutputQueue<MediaPacket>>,
    /// Raised by the session when it is torn down.
    pub cancel: CancellationToken,
}

enum Control {
    Join {
        id: String,
        subscriber: Subscriber,
        ack: oneshot::Sender<()>,
    },
    Leave {
        id: String,
        ack: oneshot::Sender<bool>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

// ── FanoutHandle ─────────────────────────────────────────────────

/// Cloneable handle to one fan-out loop.
#[derive(Debug, Clone)]
pub struct FanoutHandle {
    kind: MediaKind,
    control: mpsc::Sender<Control>,
}

impl FanoutHandle {
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Register `subscriber` under `id`. Returns once the loop has
    /// applied it. A previous subscriber with the same id is closed.
    pub async fn join(&self, id: impl Into<String>, subscriber: Subscriber) -> Result<(), RelayError> {
        let (ack, done) = oneshot::channel();
        self.control
            .send(Control::Join {
                id: id.into(),
                subscriber,
                ack,
            })
            .await?;
        done.await.map_err(|_| RelayError::ChannelClosed)
    }

    /// Remove `id` and close its queue. Returns whether it was present.
    pub async fn leave(&self, id: impl Into<String>) -> Result<bool, RelayError> {
        let (ack, done) = oneshot::channel();
        self.control
            .send(Control::Leave { id: id.into(), ack })
            .await?;
        done.await.map_err(|_| RelayError::ChannelClosed)
    }

    /// Number of registered subscribers.
    pub async fn subscriber_count(&self) -> Result<usize, RelayError> {
        let (reply, done) = oneshot::channel();
        self.control.send(Control::Count { reply }).await?;
        done.await.map_err(|_| RelayError::ChannelClosed)
    }
}

// ── Fan-out loop ─────────────────────────────────────────────────

struct Fanout {
    kind: MediaKind,
    registry: HashMap<String, Subscriber>,
    delivered: u64,
    dropped: u64,
}

/// Spawn the fan-out loop for one stream.
///
/// The loop ends when `source` ends or `shutdown` fires, closing every
/// remaining subscriber's queue.
pub fn spawn_fanout<S>(
    kind: MediaKind,
    source: S,
    shutdown: CancellationToken,
) -> (FanoutHandle, JoinHandle<()>)
where
    S: Stream<Item = MediaPacket> + Send + Unpin + 'static,
{
    let (control, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let fanout = Fanout {
        kind,
        registry: HashMap::new(),
        delivered: 0,
        dropped: 0,
    };
    let task = tokio::spawn(fanout.run(source, control_rx, shutdown));
    (FanoutHandle { kind, control }, task)
}

impl Fanout {
    async fn run<S>(
        mut self,
        mut source: S,
        mut control: mpsc::Receiver<Control>,
        shutdown: CancellationToken,
    ) where
        S: Stream<Item = MediaPacket> + Unpin,
    {
        info!("{} fan-out started", self.kind);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(ctl) = control.recv() => self.apply(ctl),
                packet = source.next() => match packet {
                    Some(packet) => self.deliver(packet),
                    None => {
                        info!("{} source ended", self.kind);
                        break;
                    }
                },
            }
        }

        for (_, sub) in self.registry.drain() {
            sub.queue.close();
        }
        info!(
            "{} fan-out stopped: {} delivered, {} dropped",
            self.kind, self.delivered, self.dropped
        );
    }

    fn apply(&mut self, ctl: Control) {
        match ctl {
            Control::Join { id, subscriber, ack } => {
                debug!("{} fan-out: {id} joined", self.kind);
                if let Some(old) = self.registry.insert(id, subscriber) {
                    old.queue.close();
                }
                let _ = ack.send(());
            }
            Control::Leave { id, ack } => {
                let removed = match self.registry.remove(&id) {
                    Some(sub) => {
                        sub.queue.close();
                        debug!("{} fan-out: {id} left", self.kind);
                        true
                    }
                    None => false,
                };
                let _ = ack.send(removed);
            }
            Control::Count { reply } => {
                let _ = reply.send(self.registry.len());
            }
        }
    }

    fn deliver(&mut self, packet: MediaPacket) {
        let kind = self.kind;
        let mut delivered = 0;
        let mut dropped = 0;

        self.registry.retain(|id, sub| {
            if sub.cancel.is_cancelled() {
                sub.queue.close();
                debug!("{kind} fan-out: {id} cancelled, removed");
                return false;
            }
            match sub.queue.try_push(packet.clone()) {
                Delivery::Sent => {
                    delivered += 1;
                    true
                }
                Delivery::Full => {
                    dropped += 1;
                    trace!("{kind} fan-out: {id} full, packet dropped");
                    true
                }
                Delivery::Closed => {
                    debug!("{kind} fan-out: {id} queue closed, removed");
                    false
                }
            }
        });

        self.delivered += delivered;
        self.dropped += dropped;
    }
}

// ── Broadcaster ──────────────────────────────────────────────────

/// Both fan-out loops, addressed together.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    pub video: FanoutHandle,
    pub audio: FanoutHandle,
}

impl Broadcaster {
    /// Spawn video and audio fan-out loops over the two capture streams.
    pub fn spawn<V, A>(
        video: V,
        audio: A,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>)
    where
        V: Stream<Item = MediaPacket> + Send + Unpin + 'static,
        A: Stream<Item = MediaPacket> + Send + Unpin + 'static,
    {
        let (video, v_task) = spawn_fanout(MediaKind::Video, video, shutdown.clone());
        let (audio, a_task) = spawn_fanout(MediaKind::Audio, audio, shutdown);
        (Self { video, audio }, vec![v_task, a_task])
    }

    /// Register a session's image and audio queues.
    pub async fn join(
        &self,
        id: &str,
        image: Arc<OutputQueue<MediaPacket>>,
        audio: Arc<OutputQueue<MediaPacket>>,
        cancel: CancellationToken,
    ) -> Result<(), RelayError> {
        self.video
            .join(
                id,
                Subscriber {
                    queue: image,
                    cancel: cancel.clone(),
                },
            )
            .await?;
        self.audio.join(id, Subscriber { queue: audio, cancel }).await
    }

    /// Remove a session from both loops.
    pub async fn leave(&self, id: &str) -> Result<(), RelayError> {
        self.video.leave(id).await?;
        self.audio.leave(id).await?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::packet::rtp_fixture;
    use crate::queue::bounded;
    use std::time::Duration;
    use tokio_stream::wrappers::ReceiverStream;

    fn video_packet(seq: u16) -> MediaPacket {
        MediaPacket::parse(MediaKind::Video, rtp_fixture(seq, seq as u32, 7, b"x")).unwrap()
    }

    async fn recv(rx: &mut mpsc::Receiver<MediaPacket>) -> Option<MediaPacket> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout")
    }

    #[tokio::test]
    async fn same_packet_reaches_every_subscriber() {
        let (src_tx, src_rx) = mpsc::channel(8);
        let (handle, _task) =
            spawn_fanout(MediaKind::Video, ReceiverStream::new(src_rx), CancellationToken::new());

        let (qa, mut ra) = bounded(4);
        let (qb, mut rb) = bounded(4);
        handle
            .join("a", Subscriber { queue: Arc::new(qa), cancel: CancellationToken::new() })
            .await
            .unwrap();
        handle
            .join("b", Subscriber { queue: Arc::new(qb), cancel: CancellationToken::new() })
            .await
            .unwrap();

        src_tx.send(video_packet(1)).await.unwrap();
        assert_eq!(recv(&mut ra).await.unwrap().sequence, 1);
        assert_eq!(recv(&mut rb).await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn full_queue_drops_only_for_that_subscriber() {
        let (src_tx, src_rx) = mpsc::channel(8);
        let (handle, _task) =
            spawn_fanout(MediaKind::Video, ReceiverStream::new(src_rx), CancellationToken::new());

        let (slow_q, mut slow_rx) = bounded(1);
        let (fast_q, mut fast_rx) = bounded(4);
        handle
            .join("slow", Subscriber { queue: Arc::new(slow_q), cancel: CancellationToken::new() })
            .await
            .unwrap();
        handle
            .join("fast", Subscriber { queue: Arc::new(fast_q), cancel: CancellationToken::new() })
            .await
            .unwrap();

        src_tx.send(video_packet(1)).await.unwrap();
        src_tx.send(video_packet(2)).await.unwrap();

        assert_eq!(recv(&mut fast_rx).await.unwrap().sequence, 1);
        assert_eq!(recv(&mut fast_rx).await.unwrap().sequence, 2);

        assert_eq!(recv(&mut slow_rx).await.unwrap().sequence, 1);
        assert!(slow_rx.try_recv().is_err(), "second packet should have been dropped");
        assert_eq!(handle.subscriber_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancelled_subscriber_is_removed_and_closed_once() {
        let (src_tx, src_rx) = mpsc::channel(8);
        let (handle, _task) =
            spawn_fanout(MediaKind::Video, ReceiverStream::new(src_rx), CancellationToken::new());

        let cancel = CancellationToken::new();
        let (q, mut rx) = bounded(8);
        let q = Arc::new(q);
        handle
            .join("gone", Subscriber { queue: Arc::clone(&q), cancel: cancel.clone() })
            .await
            .unwrap();

        src_tx.send(video_packet(1)).await.unwrap();
        assert_eq!(recv(&mut rx).await.unwrap().sequence, 1);

        cancel.cancel();
        src_tx.send(video_packet(2)).await.unwrap();
        src_tx.send(video_packet(3)).await.unwrap();

        assert!(recv(&mut rx).await.is_none());
        assert!(q.is_closed());
        assert!(!q.close(), "queue must already be closed exactly once");
        assert_eq!(handle.subscriber_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn leave_closes_queue() {
        let (_src_tx, src_rx) = mpsc::channel::<MediaPacket>(8);
        let (handle, _task) =
            spawn_fanout(MediaKind::Audio, ReceiverStream::new(src_rx), CancellationToken::new());

        let (q, mut rx) = bounded(2);
        handle
            .join("s", Subscriber { queue: Arc::new(q), cancel: CancellationToken::new() })
            .await
            .unwrap();
        assert!(handle.leave("s").await.unwrap());
        assert!(!handle.leave("s").await.unwrap());
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn source_end_closes_everyone() {
        let (src_tx, src_rx) = mpsc::channel::<MediaPacket>(8);
        let (handle, task) =
            spawn_fanout(MediaKind::Video, ReceiverStream::new(src_rx), CancellationToken::new());
        let (q, mut rx) = bounded(2);
        handle
            .join("s", Subscriber { queue: Arc::new(q), cancel: CancellationToken::new() })
            .await
            .unwrap();

        drop(src_tx);
        task.await.unwrap();
        assert!(recv(&mut rx).await.is_none());
        assert!(handle.subscriber_count().await.is_err());
    }
}
