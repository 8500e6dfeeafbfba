//! Integration tests: client sessions over a real TCP signaling socket,
//! broadcaster fan-out across sessions, and agent reconnects.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use vmcast_core::queue;
use vmcast_core::{
    AgentClient, AgentConfig, AgentRelay, Broadcaster, Connectivity, Envelope, InputEvent,
    KeyEvent, KeyState, MediaKind, MediaPacket, MediaTransport, NegotiationRequest,
    ProtocolConfig, Readiness, Relay, RelayError, SessionConfig, SessionPhase, TransportEvent,
    TransportFactory, TransportSink, kinds, line_transport,
};

// ── Mock transport ───────────────────────────────────────────────

#[derive(Default)]
struct MockTransport {
    remote: Mutex<Option<String>>,
    candidates: Mutex<Vec<String>>,
    video: AtomicUsize,
    audio: AtomicUsize,
    closed: AtomicUsize,
    fail_offer: bool,
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn create_offer(&self) -> Result<String, RelayError> {
        if self.fail_offer {
            return Err(RelayError::Negotiation("no codecs".into()));
        }
        Ok("mock-offer".into())
    }

    async fn set_remote_description(&self, encoded: &str) -> Result<(), RelayError> {
        *self.remote.lock().unwrap() = Some(encoded.to_string());
        Ok(())
    }

    async fn add_remote_candidate(&self, encoded: &str) -> Result<(), RelayError> {
        self.candidates.lock().unwrap().push(encoded.to_string());
        Ok(())
    }

    async fn write_video(&self, _packet: &MediaPacket) -> Result<(), RelayError> {
        self.video.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_audio(&self, _packet: &MediaPacket) -> Result<(), RelayError> {
        self.audio.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockFactory {
    opened: Mutex<Vec<(Arc<MockTransport>, TransportSink)>>,
    fail_offers: AtomicBool,
}

impl MockFactory {
    fn opened(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    fn transport(&self, index: usize) -> (Arc<MockTransport>, TransportSink) {
        self.opened.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(
        &self,
        _request: &NegotiationRequest,
        sink: TransportSink,
    ) -> Result<Arc<dyn MediaTransport>, RelayError> {
        let transport = Arc::new(MockTransport {
            fail_offer: self.fail_offers.load(Ordering::SeqCst),
            ..MockTransport::default()
        });
        self.opened
            .lock()
            .unwrap()
            .push((Arc::clone(&transport), sink));
        Ok(transport)
    }
}

// ── Helpers ──────────────────────────────────────────────────────

type ClientSink = Pin<Box<dyn Sink<String, Error = RelayError> + Send>>;
type ClientStream = Pin<Box<dyn Stream<Item = Result<String, RelayError>> + Send>>;

fn rtp(seq: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u8(0x80);
    buf.put_u8(96);
    buf.put_u16(seq);
    buf.put_u32(seq as u32 * 3000);
    buf.put_u32(0xfeed);
    buf.put_slice(b"nal!");
    buf.freeze()
}

fn video(seq: u16) -> MediaPacket {
    MediaPacket::parse(MediaKind::Video, rtp(seq)).unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Receive the next envelope of `kind`, skipping heartbeats and
/// anything else.
async fn recv_kind(frames: &mut ClientStream, kind: &str) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = frames.next().await.expect("stream ended").unwrap();
            let env = Envelope::from_json(&frame).unwrap();
            if env.kind == kind {
                return env;
            }
        }
    })
    .await
    .expect("timeout")
}

async fn send(sink: &mut ClientSink, env: Envelope) {
    sink.send(env.to_json().unwrap()).await.unwrap();
}

struct Harness {
    relay: Arc<Relay>,
    broadcaster: Broadcaster,
    factory: Arc<MockFactory>,
    video_tx: mpsc::Sender<MediaPacket>,
    _audio_tx: mpsc::Sender<MediaPacket>,
    input_rx: mpsc::Receiver<InputEvent>,
    listener: TcpListener,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

async fn harness() -> Harness {
    let (video_tx, video_rx) = mpsc::channel(16);
    let (audio_tx, audio_rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let (broadcaster, _tasks) = Broadcaster::spawn(
        ReceiverStream::new(video_rx),
        ReceiverStream::new(audio_rx),
        shutdown.clone(),
    );

    let factory = Arc::new(MockFactory::default());
    let (input_tx, input_rx) = mpsc::channel(16);
    let relay = Relay::new(
        broadcaster.clone(),
        factory.clone(),
        input_tx,
        ProtocolConfig::default(),
        SessionConfig {
            renegotiate_delay: Duration::from_millis(10),
            ..SessionConfig::default()
        },
    )
    .with_greeting(vec![Envelope::new(kinds::ICE_CONFIG, "stun:stun.example:3478")]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    Harness {
        relay: Arc::new(relay),
        broadcaster,
        factory,
        video_tx,
        _audio_tx: audio_tx,
        input_rx,
        listener,
        addr,
        shutdown,
    }
}

/// Connect a client; returns its frames plus the relay-side connection
/// running in the background.
async fn connect(
    h: &Harness,
) -> (
    ClientSink,
    ClientStream,
    Arc<vmcast_core::MediaSession>,
    tokio::task::JoinHandle<()>,
) {
    let client = TcpStream::connect(h.addr).await.unwrap();
    let (server, _) = h.listener.accept().await.unwrap();

    let (sink, frames) = line_transport(server);
    let connection = h.relay.connect(sink).await.unwrap();
    let session = Arc::clone(connection.session());
    let task = tokio::spawn(connection.run(frames, h.shutdown.clone()));

    let (tx, rx) = line_transport(client);
    (Box::pin(tx), Box::pin(rx), session, task)
}

// ── Session lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn test_session_lifecycle() {
    let mut h = harness().await;
    let (mut tx, mut rx, session, task) = connect(&h).await;

    let greeting = recv_kind(&mut rx, kinds::ICE_CONFIG).await;
    assert_eq!(greeting.payload, "stun:stun.example:3478");
    assert_eq!(session.phase(), SessionPhase::Idle);

    // Negotiation-init gets an offer stamped with the request's ids.
    let mut init = Envelope::new(kinds::INIT_WEBRTC, r#"{"is_mobile":false}"#);
    init.correlation_id = "req-1".into();
    init.session_id = "s-1".into();
    send(&mut tx, init).await;

    let offer = recv_kind(&mut rx, kinds::OFFER).await;
    assert_eq!(offer.payload, "mock-offer");
    assert_eq!(offer.correlation_id, "req-1");
    assert_eq!(offer.session_id, "s-1");
    assert_eq!(session.phase(), SessionPhase::Negotiating);

    // Local candidates trickle back under the negotiation's ids.
    let (transport, sink) = h.factory.transport(0);
    sink.events
        .send(TransportEvent::LocalCandidate(Some("cand-a".into())))
        .await
        .unwrap();
    let cand = recv_kind(&mut rx, kinds::CANDIDATE).await;
    assert_eq!(cand.payload, "cand-a");
    assert_eq!(cand.correlation_id, "req-1");

    send(&mut tx, Envelope::new(kinds::ANSWER, "remote-sdp")).await;
    eventually(|| session.phase() == SessionPhase::Connected).await;
    assert_eq!(transport.remote.lock().unwrap().as_deref(), Some("remote-sdp"));

    send(&mut tx, Envelope::new(kinds::CANDIDATE, "remote-cand")).await;
    eventually(|| transport.candidates.lock().unwrap().len() == 1).await;

    sink.events
        .send(TransportEvent::Connectivity(Connectivity::Connected))
        .await
        .unwrap();
    eventually(|| session.phase().is_streaming()).await;

    // Broadcast video reaches the transport.
    h.video_tx.send(video(1)).await.unwrap();
    eventually(|| transport.video.load(Ordering::SeqCst) == 1).await;

    // Input from signaling and from the data channel, in order.
    send(&mut tx, Envelope::new(kinds::KEY_DOWN, r#"{"keycode":65}"#)).await;
    let event = tokio::time::timeout(Duration::from_secs(5), h.input_rx.recv())
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(event, InputEvent::Key(KeyEvent::new(65, KeyState::Pressed)));

    let dc = Envelope::new(kinds::KEY_UP, r#"{"keycode":65}"#);
    sink.inbound
        .send(Bytes::from(dc.to_json().unwrap()))
        .await
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), h.input_rx.recv())
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(event, InputEvent::Key(KeyEvent::new(65, KeyState::Released)));

    // Client goes away: everything is torn down once.
    drop(tx);
    drop(rx);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("timeout")
        .unwrap();

    assert!(session.is_closed());
    assert!(session.cancel_token().is_cancelled());
    assert_eq!(session.phase(), SessionPhase::Closed);
    assert!(session.queues_closed());
    assert!(!session.image_queue().close());
    assert!(!session.audio_queue().close());
    assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    assert_eq!(h.broadcaster.video.subscriber_count().await.unwrap(), 0);
    assert_eq!(h.relay.active_clients(), 0);
}

#[tokio::test]
async fn test_renegotiation_replaces_transport() {
    let h = harness().await;
    let (mut tx, mut rx, session, task) = connect(&h).await;

    send(&mut tx, Envelope::new(kinds::INIT_WEBRTC, "")).await;
    recv_kind(&mut rx, kinds::OFFER).await;
    send(&mut tx, Envelope::new(kinds::ANSWER, "sdp-1")).await;
    eventually(|| session.phase() == SessionPhase::Connected).await;
    let (first, sink) = h.factory.transport(0);
    sink.events
        .send(TransportEvent::Connectivity(Connectivity::Connected))
        .await
        .unwrap();
    eventually(|| session.phase().is_streaming()).await;

    send(&mut tx, Envelope::new(kinds::INIT_WEBRTC, r#"{"is_mobile":true}"#)).await;
    recv_kind(&mut rx, kinds::OFFER).await;
    assert_eq!(h.factory.opened(), 2);
    assert_eq!(first.closed.load(Ordering::SeqCst), 1);
    assert_eq!(session.phase(), SessionPhase::Negotiating);

    h.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("timeout")
        .unwrap();
    assert!(session.is_closed());
    assert_eq!(h.factory.transport(1).0.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transport_failure_closes_only_that_session() {
    let h = harness().await;
    let (mut tx_a, mut rx_a, session_a, task_a) = connect(&h).await;
    let (mut tx_b, mut rx_b, session_b, _task_b) = connect(&h).await;

    send(&mut tx_a, Envelope::new(kinds::INIT_WEBRTC, "")).await;
    recv_kind(&mut rx_a, kinds::OFFER).await;
    send(&mut tx_b, Envelope::new(kinds::INIT_WEBRTC, "")).await;
    recv_kind(&mut rx_b, kinds::OFFER).await;

    let (_, sink_a) = h.factory.transport(0);
    sink_a
        .events
        .send(TransportEvent::Connectivity(Connectivity::Failed))
        .await
        .unwrap();

    eventually(|| session_a.is_closed()).await;
    assert!(session_a.queues_closed());
    assert_eq!(session_b.phase(), SessionPhase::Negotiating);
    assert!(!session_b.queues_closed());

    // The signaling socket itself stays up until the client leaves.
    drop(tx_a);
    drop(rx_a);
    tokio::time::timeout(Duration::from_secs(5), task_a)
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(h.broadcaster.video.subscriber_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_offer_closes_session_without_reply() {
    let h = harness().await;
    h.factory.fail_offers.store(true, Ordering::SeqCst);
    let (mut tx, _rx, session, _task) = connect(&h).await;

    send(&mut tx, Envelope::new(kinds::INIT_WEBRTC, "")).await;
    eventually(|| session.is_closed()).await;
    assert_eq!(h.factory.transport(0).0.closed.load(Ordering::SeqCst), 1);

    // A closed session refuses to negotiate again.
    send(&mut tx, Envelope::new(kinds::INIT_WEBRTC, "")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.factory.opened(), 1);
}

#[tokio::test]
async fn test_malformed_negotiation_is_dropped() {
    let h = harness().await;
    let (mut tx, mut rx, session, _task) = connect(&h).await;

    send(&mut tx, Envelope::new(kinds::INIT_WEBRTC, "{not json")).await;
    send(&mut tx, Envelope::new(kinds::INIT_WEBRTC, "")).await;
    recv_kind(&mut rx, kinds::OFFER).await;
    assert_eq!(h.factory.opened(), 1);
    assert_eq!(session.phase(), SessionPhase::Negotiating);
}

// ── Broadcaster ──────────────────────────────────────────────────

#[tokio::test]
async fn test_full_queue_drops_for_one_session_only() {
    let (video_tx, video_rx) = mpsc::channel(16);
    let (_audio_tx, audio_rx) = mpsc::channel::<MediaPacket>(16);
    let shutdown = CancellationToken::new();
    let (broadcaster, _tasks) = Broadcaster::spawn(
        ReceiverStream::new(video_rx),
        ReceiverStream::new(audio_rx),
        shutdown.clone(),
    );

    let (slow, mut slow_rx) = queue::bounded(1);
    let (fast, mut fast_rx) = queue::bounded(8);
    let (slow_audio, _) = queue::bounded(1);
    let (fast_audio, _) = queue::bounded(1);
    broadcaster
        .join("slow", Arc::new(slow), Arc::new(slow_audio), CancellationToken::new())
        .await
        .unwrap();
    broadcaster
        .join("fast", Arc::new(fast), Arc::new(fast_audio), CancellationToken::new())
        .await
        .unwrap();

    video_tx.send(video(1)).await.unwrap();
    video_tx.send(video(2)).await.unwrap();

    for seq in [1, 2] {
        let pkt = tokio::time::timeout(Duration::from_secs(5), fast_rx.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(pkt.sequence, seq);
    }
    assert_eq!(slow_rx.recv().await.unwrap().sequence, 1);
    assert!(slow_rx.try_recv().is_err());

    shutdown.cancel();
}

// ── Agent relay ──────────────────────────────────────────────────

#[tokio::test]
async fn test_agent_reconnect_resumes_input() {
    let relay = AgentRelay::bind("127.0.0.1:0".parse().unwrap(), AgentConfig::default())
        .await
        .unwrap();
    let addr = relay.local_addr().unwrap();
    let mut ready = relay.readiness();
    let (events, events_rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(relay.run(events_rx, shutdown.clone()));

    let mut first = AgentClient::connect(addr, Duration::from_secs(6)).await.unwrap();
    ready.wait_for(|r| *r == Readiness::Ready).await.unwrap();
    events
        .send(InputEvent::Key(KeyEvent::new(1, KeyState::Pressed)))
        .await
        .unwrap();
    assert!(first.next_event().await.unwrap().is_some());

    // Agent drops mid-stream.
    drop(first);
    tokio::time::timeout(
        Duration::from_secs(5),
        ready.wait_for(|r| *r == Readiness::NotReady),
    )
    .await
    .expect("timeout")
    .unwrap();

    // Input while the agent is away is not replayed later.
    events
        .send(InputEvent::Key(KeyEvent::new(2, KeyState::Pressed)))
        .await
        .unwrap();
    while events.capacity() < events.max_capacity() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut second = TcpStream::connect(addr).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        ready.wait_for(|r| *r == Readiness::Ready),
    )
    .await
    .expect("timeout")
    .unwrap();

    events
        .send(InputEvent::Key(KeyEvent::new(65, KeyState::Pressed)))
        .await
        .unwrap();

    let mut frame = Vec::new();
    while !frame.ends_with(b"|") {
        let byte = tokio::time::timeout(Duration::from_secs(5), second.read_u8())
            .await
            .expect("timeout")
            .unwrap();
        if byte != 0 {
            frame.push(byte);
        }
    }
    assert_eq!(frame, b"K65,1|");

    shutdown.cancel();
    task.await.unwrap();
}
