//! Per-client media sessions.
//!
//! A [`MediaSession`] owns one client's transport, its image and audio
//! output queues, and the forwarding loops between them. Signaling
//! drives it through [`SessionPhase`]; the transport's own connectivity
//! reports start streaming or tear it down.
//!
//! Each negotiation opens a new transport generation with its own child
//! cancel token and task tracker. Renegotiation shuts the previous
//! generation down completely before the next one is opened.

pub mod phase;
pub mod routes;
pub mod transport;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::broadcast::{MediaKind, MediaPacket};
use crate::envelope::{Envelope, kinds};
use crate::error::RelayError;
use crate::input::InputEvent;
use crate::protocol::PacketClient;
use crate::queue::{self, OutputQueue};

pub use phase::SessionPhase;
pub use transport::{
    Connectivity, MediaTransport, NegotiationRequest, TransportEvent, TransportFactory,
    TransportSink,
};

type PacketSlot = Arc<Mutex<Option<mpsc::Receiver<MediaPacket>>>>;

// ── SessionConfig ────────────────────────────────────────────────

/// Sizing and timing for media sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of each per-session image/audio queue.
    pub queue_capacity: usize,
    /// Capacity of the transport's event and inbound data queues.
    pub transport_queue: usize,
    /// Pause between tearing down an old transport and opening a new one.
    pub renegotiate_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 30,
            transport_queue: 100,
            renegotiate_delay: Duration::from_secs(2),
        }
    }
}

// ── Generation ───────────────────────────────────────────────────

#[derive(Clone)]
struct Generation {
    transport: Arc<dyn MediaTransport>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    inbound: Arc<Mutex<Option<mpsc::Receiver<Bytes>>>>,
}

impl Generation {
    /// Stop every loop of this generation, then close its transport.
    async fn shutdown(self, session_id: &str) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if let Err(e) = self.transport.close().await {
            debug!("session {session_id}: transport close failed: {e}");
        }
    }
}

// ── MediaSession ─────────────────────────────────────────────────

/// One remote client's media state.
pub struct MediaSession {
    id: String,
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    signaler: Weak<PacketClient>,
    phase: Mutex<SessionPhase>,
    generation: tokio::sync::Mutex<Option<Generation>>,
    image: Arc<OutputQueue<MediaPacket>>,
    audio: Arc<OutputQueue<MediaPacket>>,
    image_rx: PacketSlot,
    audio_rx: PacketSlot,
    input: mpsc::Sender<InputEvent>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSession")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl MediaSession {
    /// Create an idle session.
    ///
    /// `signaler` carries trickle candidates back to the client; `input`
    /// is the application's shared input queue.
    pub fn new(
        id: impl Into<String>,
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        signaler: Weak<PacketClient>,
        input: mpsc::Sender<InputEvent>,
    ) -> Arc<Self> {
        let (image, image_rx) = queue::bounded(config.queue_capacity);
        let (audio, audio_rx) = queue::bounded(config.queue_capacity);
        Arc::new(Self {
            id: id.into(),
            config,
            factory,
            signaler,
            phase: Mutex::new(SessionPhase::Idle),
            generation: tokio::sync::Mutex::new(None),
            image: Arc::new(image),
            audio: Arc::new(audio),
            image_rx: Arc::new(Mutex::new(Some(image_rx))),
            audio_rx: Arc::new(Mutex::new(Some(audio_rx))),
            input,
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the current phase.
    pub fn phase(&self) -> SessionPhase {
        match self.phase.lock() {
            Ok(phase) => phase.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The session's cancel signal. Raising it starts teardown of every
    /// forwarding loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sending side of the image queue, for the video fan-out.
    pub fn image_queue(&self) -> Arc<OutputQueue<MediaPacket>> {
        Arc::clone(&self.image)
    }

    /// Sending side of the audio queue, for the audio fan-out.
    pub fn audio_queue(&self) -> Arc<OutputQueue<MediaPacket>> {
        Arc::clone(&self.audio)
    }

    pub fn queues_closed(&self) -> bool {
        self.image.is_closed() && self.audio.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Wait until teardown has finished.
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    fn transition(
        &self,
        step: impl FnOnce(&mut SessionPhase) -> Result<(), RelayError>,
    ) -> Result<(), RelayError> {
        let mut phase = self
            .phase
            .lock()
            .map_err(|_| RelayError::Other("session phase lock poisoned".into()))?;
        let before = phase.to_string();
        step(&mut phase)?;
        debug!("session {}: {before} -> {}", self.id, *phase);
        Ok(())
    }

    // ── Signaling ────────────────────────────────────────────────

    /// Handle a negotiation-init request and return the encoded local
    /// description.
    ///
    /// An undecodable request is dropped. Any later failure closes the
    /// session.
    pub async fn negotiate(self: &Arc<Self>, request: &Envelope) -> Result<String, RelayError> {
        let params = NegotiationRequest::parse(&request.payload)?;
        match self.open_generation(&params, request).await {
            Ok(offer) => Ok(offer),
            Err(e) => {
                warn!("session {}: negotiation failed: {e}", self.id);
                self.close().await;
                Err(e)
            }
        }
    }

    async fn open_generation(
        self: &Arc<Self>,
        params: &NegotiationRequest,
        request: &Envelope,
    ) -> Result<String, RelayError> {
        let mut slot = self.generation.lock().await;
        self.transition(SessionPhase::begin_negotiation)?;
        info!("session {}: negotiating (mobile: {})", self.id, params.is_mobile);

        if let Some(previous) = slot.take() {
            debug!("session {}: replacing transport", self.id);
            previous.shutdown(&self.id).await;
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(RelayError::ConnectionClosed),
                _ = tokio::time::sleep(self.config.renegotiate_delay) => {}
            }
        }
        if self.cancel.is_cancelled() {
            return Err(RelayError::ConnectionClosed);
        }

        let (events_tx, events_rx) = mpsc::channel(self.config.transport_queue);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.transport_queue);
        let sink = TransportSink {
            events: events_tx,
            inbound: inbound_tx,
        };
        let transport = self.factory.open(params, sink).await?;

        let generation = Generation {
            transport: Arc::clone(&transport),
            cancel: self.cancel.child_token(),
            tracker: TaskTracker::new(),
            inbound: Arc::new(Mutex::new(Some(inbound_rx))),
        };
        let origin = Envelope {
            correlation_id: request.correlation_id.clone(),
            session_id: request.session_id.clone(),
            ..Envelope::default()
        };
        generation.tracker.spawn(Arc::clone(self).watch_transport(
            generation.clone(),
            events_rx,
            origin,
        ));
        *slot = Some(generation);

        transport
            .create_offer()
            .await
            .map_err(|e| RelayError::Negotiation(e.to_string()))
    }

    /// Apply the client's remote description.
    pub async fn apply_remote_description(&self, encoded: &str) -> Result<(), RelayError> {
        let transport = {
            let slot = self.generation.lock().await;
            let Some(generation) = slot.as_ref() else {
                return Err(RelayError::ProtocolViolation(
                    "remote description before negotiation",
                ));
            };
            self.transition(SessionPhase::apply_remote_description)?;
            Arc::clone(&generation.transport)
        };

        if let Err(e) = transport.set_remote_description(encoded).await {
            warn!("session {}: bad remote description: {e}", self.id);
            self.close().await;
            return Err(RelayError::Negotiation(e.to_string()));
        }
        Ok(())
    }

    /// Apply a remote candidate. Best effort: errors are returned for
    /// logging and never close the session.
    pub async fn add_remote_candidate(&self, encoded: &str) -> Result<(), RelayError> {
        if !self.phase().accepts_candidates() {
            debug!("session {}: candidate ignored in {}", self.id, self.phase());
            return Ok(());
        }
        if encoded.is_empty() {
            trace!("session {}: remote end of candidates", self.id);
            return Ok(());
        }
        let transport = self
            .generation
            .lock()
            .await
            .as_ref()
            .map(|g| Arc::clone(&g.transport));
        match transport {
            Some(transport) => transport.add_remote_candidate(encoded).await,
            None => Ok(()),
        }
    }

    /// Forward an input envelope received over signaling to the
    /// application's input queue.
    pub async fn submit_input(&self, envelope: &Envelope) {
        match InputEvent::from_envelope(envelope) {
            Ok(Some(event)) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    sent = self.input.send(event) => {
                        if sent.is_err() {
                            debug!("session {}: input queue closed", self.id);
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => debug!("session {}: dropping input {:?}: {e}", self.id, envelope.kind),
        }
    }

    // ── Transport events ─────────────────────────────────────────

    async fn watch_transport(
        self: Arc<Self>,
        generation: Generation,
        mut events: mpsc::Receiver<TransportEvent>,
        origin: Envelope,
    ) {
        loop {
            let event = tokio::select! {
                _ = generation.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::LocalCandidate(candidate) => {
                    self.signal_candidate(candidate, &origin).await;
                }
                TransportEvent::Connectivity(state) => {
                    info!("session {}: transport {state}", self.id);
                    if state == Connectivity::Connected {
                        if let Err(e) = self.start_streaming(&generation) {
                            warn!("session {}: cannot stream: {e}", self.id);
                        }
                    } else if state.is_terminal() {
                        // Teardown waits on this loop, so it runs elsewhere.
                        let session = Arc::clone(&self);
                        tokio::spawn(async move { session.close().await });
                        break;
                    }
                }
            }
        }
    }

    async fn signal_candidate(&self, candidate: Option<String>, origin: &Envelope) {
        let Some(client) = self.signaler.upgrade() else {
            return;
        };
        let envelope = Envelope {
            kind: kinds::CANDIDATE.into(),
            payload: candidate.unwrap_or_default(),
            correlation_id: origin.correlation_id.clone(),
            session_id: origin.session_id.clone(),
        };
        if let Err(e) = client.post(&envelope).await {
            debug!("session {}: candidate not delivered: {e}", self.id);
        }
    }

    fn start_streaming(&self, generation: &Generation) -> Result<(), RelayError> {
        self.transition(SessionPhase::begin_streaming)?;

        generation.tracker.spawn(forward_media(
            MediaKind::Video,
            Arc::clone(&self.image_rx),
            Arc::clone(&generation.transport),
            generation.cancel.clone(),
        ));
        generation.tracker.spawn(forward_media(
            MediaKind::Audio,
            Arc::clone(&self.audio_rx),
            Arc::clone(&generation.transport),
            generation.cancel.clone(),
        ));

        let inbound = generation.inbound.lock().ok().and_then(|mut g| g.take());
        if let Some(inbound) = inbound {
            generation.tracker.spawn(forward_input(
                inbound,
                self.input.clone(),
                generation.cancel.clone(),
            ));
        }

        info!("session {}: streaming", self.id);
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Tear the session down. Idempotent; concurrent callers all return
    /// once teardown has finished.
    pub async fn close(&self) {
        let (first, streamed) = match self.phase.lock() {
            Ok(mut phase) => {
                let streamed = phase.streaming_duration();
                (phase.close(), streamed)
            }
            Err(poisoned) => (poisoned.into_inner().close(), None),
        };
        self.cancel.cancel();
        if !first {
            self.done.cancelled().await;
            return;
        }

        debug!("session {}: closing", self.id);
        let generation = self.generation.lock().await.take();
        if let Some(generation) = generation {
            generation.shutdown(&self.id).await;
        }
        self.image.close();
        self.audio.close();
        self.done.cancel();
        match streamed {
            Some(streamed) => info!("session {}: closed after streaming {streamed:?}", self.id),
            None => info!("session {}: closed", self.id),
        }
    }
}

// ── Forwarding loops ─────────────────────────────────────────────

/// Drain one output queue into the transport until cancelled or the
/// queue is closed. The receiver is put back for the next generation.
async fn forward_media(
    kind: MediaKind,
    slot: PacketSlot,
    transport: Arc<dyn MediaTransport>,
    cancel: CancellationToken,
) {
    let Some(mut rx) = slot.lock().ok().and_then(|mut g| g.take()) else {
        warn!("{kind} queue already has a reader");
        return;
    };

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        let written = match kind {
            MediaKind::Video => transport.write_video(&packet).await,
            MediaKind::Audio => transport.write_audio(&packet).await,
        };
        if let Err(e) = written {
            trace!("{kind} write failed: {e}");
        }
    }

    if let Ok(mut g) = slot.lock() {
        *g = Some(rx);
    }
}

/// Decode data-channel messages into the application input queue, in
/// receipt order.
async fn forward_input(
    mut inbound: mpsc::Receiver<Bytes>,
    input: mpsc::Sender<InputEvent>,
    cancel: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            data = inbound.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };
        match InputEvent::from_datagram(&data) {
            Ok(Some(event)) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = input.send(event) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(None) => trace!("ignoring non-input data-channel message"),
            Err(e) => debug!("dropping data-channel message: {e}"),
        }
    }
}
