//! Framed envelope protocol over a persistent bidirectional connection.
//!
//! A [`PacketClient`] owns the write half of one connection. The read
//! half is driven by [`PacketClient::listen`], which matches replies to
//! pending calls first and falls back to kind routes second. A separate
//! [`PacketClient::heartbeat`] task keeps the peer alive until the
//! connection's `done` token fires.
//!
//! Routed handlers never run on the read loop itself. Each handler
//! registered with [`PacketClient::receive`] gets its own task; handlers
//! registered with [`PacketClient::receive_in_order`] share one lane and
//! run in receipt order. The read loop only ever hands off without
//! waiting, so a handler awaiting a reply on its own connection cannot
//! stop that reply from being read.
//!
//! Writes are serialized behind one async lock and bounded by a write
//! deadline. Only the read loop closes the connection.

pub mod pending;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::envelope::{Envelope, kinds};
use crate::error::RelayError;

pub use pending::{PendingCall, PendingCalls, ReplyCallback};

/// Boxed write half of a connection, one text frame per item.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = RelayError> + Send>>;

type RouteHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, Envelope> + Send + Sync>;

#[derive(Clone)]
struct Route {
    handler: RouteHandler,
    in_order: bool,
}

/// Longest JSON line accepted by [`line_transport`].
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// In-order envelopes waiting for their handler. Overflow is dropped.
pub const ORDERED_QUEUE: usize = 256;

// ── ProtocolConfig ───────────────────────────────────────────────

/// Timing for one packet connection.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Interval between heartbeat envelopes.
    pub heartbeat_interval: Duration,
    /// Deadline for a single frame write, including waiting for the lock.
    pub write_timeout: Duration,
    /// Silence after which the read loop gives up. `None` waits forever.
    pub read_timeout: Option<Duration>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            write_timeout: Duration::from_secs(20),
            read_timeout: Some(Duration::from_secs(20)),
        }
    }
}

// ── PacketClient ─────────────────────────────────────────────────

/// One end of an envelope connection.
pub struct PacketClient {
    id: String,
    config: ProtocolConfig,
    writer: tokio::sync::Mutex<FrameSink>,
    pending: Mutex<PendingCalls>,
    routes: RwLock<HashMap<String, Route>>,
    done: CancellationToken,
}

impl std::fmt::Debug for PacketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketClient")
            .field("id", &self.id)
            .field("closed", &self.done.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PacketClient {
    /// Wrap the write half of a connection.
    pub fn new<S>(sink: S, config: ProtocolConfig) -> Arc<Self>
    where
        S: Sink<String, Error = RelayError> + Send + 'static,
    {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            config,
            writer: tokio::sync::Mutex::new(Box::pin(sink)),
            pending: Mutex::new(PendingCalls::new()),
            routes: RwLock::new(HashMap::new()),
            done: CancellationToken::new(),
        })
    }

    /// Unique id of this connection.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token cancelled once the connection has terminated.
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Wait for the connection to terminate.
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    // ── Routes ───────────────────────────────────────────────────

    /// Register the handler for inbound envelopes of `kind`.
    ///
    /// The handler's return value is written back stamped with the
    /// request's ids, unless it is [`Envelope::noop`]. Every request runs
    /// in its own task, so a slow handler delays nothing else.
    pub fn receive<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Envelope> + Send + 'static,
    {
        self.add_route(kind.into(), false, Arc::new(move |env| handler(env).boxed()));
    }

    /// Like [`receive`](Self::receive), but requests for every in-order
    /// kind share one lane and are handled one at a time in receipt
    /// order. When the lane is full the request is dropped.
    pub fn receive_in_order<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Envelope> + Send + 'static,
    {
        self.add_route(kind.into(), true, Arc::new(move |env| handler(env).boxed()));
    }

    fn add_route(&self, kind: String, in_order: bool, handler: RouteHandler) {
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(kind, Route { handler, in_order });
        }
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Send a request under a fresh correlation id.
    ///
    /// When `on_reply` is given it fires at most once, with the reply
    /// carrying the same id. The no-op marker is never written.
    pub async fn send(
        &self,
        mut envelope: Envelope,
        on_reply: Option<ReplyCallback>,
    ) -> Result<(), RelayError> {
        if envelope.is_noop() {
            trace!("not sending no-op envelope");
            return Ok(());
        }
        if self.done.is_cancelled() {
            return Err(RelayError::ConnectionClosed);
        }

        let correlation_id = Uuid::new_v4().to_string();
        envelope.correlation_id = correlation_id.clone();

        if let Some(callback) = on_reply {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| RelayError::Other("pending call table poisoned".into()))?;
            // close() clears the table under this lock right after cancelling.
            if self.done.is_cancelled() {
                return Err(RelayError::ConnectionClosed);
            }
            pending.track(correlation_id.clone(), callback);
        }

        let result = self.write(&envelope).await;
        if result.is_err() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.forget(&correlation_id);
            }
        }
        result
    }

    /// Send a request and wait for its reply.
    ///
    /// Fails with [`RelayError::ConnectionClosed`] if the connection
    /// terminates first.
    pub async fn send_and_await(&self, envelope: Envelope) -> Result<Envelope, RelayError> {
        let (tx, rx) = oneshot::channel();
        let callback: ReplyCallback = Box::new(move |reply| {
            let _ = tx.send(reply);
        });
        self.send(envelope, Some(callback)).await?;
        rx.await.map_err(|_| RelayError::ConnectionClosed)
    }

    /// Write an envelope exactly as given, keeping its ids. Replies and
    /// trickle notifications go through here.
    pub async fn post(&self, envelope: &Envelope) -> Result<(), RelayError> {
        if envelope.is_noop() {
            return Ok(());
        }
        self.write(envelope).await
    }

    async fn write(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let frame = envelope.to_json()?;
        let deadline = self.config.write_timeout;

        tokio::time::timeout(deadline, async {
            let mut writer = self.writer.lock().await;
            writer.send(frame).await
        })
        .await
        .map_err(|_| RelayError::Timeout(deadline))?
    }

    // ── Heartbeat ────────────────────────────────────────────────

    /// Send a heartbeat envelope every interval until the connection ends.
    pub async fn heartbeat(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.heartbeat_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.done.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.send(Envelope::new(kinds::HEARTBEAT, ""), None).await {
                        debug!("heartbeat on {} failed: {e}", self.id);
                    }
                }
            }
        }
        trace!("heartbeat on {} stopped", self.id);
    }

    // ── Read loop ────────────────────────────────────────────────

    /// Drive the read half until it fails, ends, or goes silent past
    /// the read deadline. Then terminate the connection.
    pub async fn listen<St>(self: Arc<Self>, mut frames: St)
    where
        St: Stream<Item = Result<String, RelayError>> + Unpin + Send,
    {
        let handlers = TaskTracker::new();
        let (lane_tx, lane_rx) = mpsc::channel(ORDERED_QUEUE);
        handlers.spawn(Arc::clone(&self).run_in_order(lane_rx));

        loop {
            let next = tokio::select! {
                _ = self.done.cancelled() => break,
                next = next_frame(&mut frames, self.config.read_timeout) => next,
            };

            let frame = match next {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    debug!("read on {} failed: {e}", self.id);
                    break;
                }
                Ok(None) => {
                    debug!("peer closed {}", self.id);
                    break;
                }
                Err(_) => {
                    warn!("no traffic on {} within {:?}", self.id, self.config.read_timeout);
                    break;
                }
            };

            let envelope = match Envelope::from_json(&frame) {
                Ok(env) => env,
                Err(e) => {
                    warn!("dropping undecodable frame on {}: {e}", self.id);
                    continue;
                }
            };

            if self.fire_pending(envelope.clone()) {
                continue;
            }
            self.route(envelope, &handlers, &lane_tx);
        }

        drop(lane_tx);
        self.close();
        handlers.close();
        handlers.wait().await;

        let mut writer = self.writer.lock().await;
        let _ = tokio::time::timeout(self.config.write_timeout, writer.close()).await;
    }

    /// Terminate the connection: raise `done` and drop every pending
    /// callback. Idempotent.
    pub fn close(&self) {
        if self.done.is_cancelled() {
            return;
        }
        self.done.cancel();
        if let Ok(mut pending) = self.pending.lock() {
            let dropped = pending.clear();
            if dropped > 0 {
                debug!("{} dropped {dropped} pending call(s)", self.id);
            }
        }
    }

    /// Fire the callback matching `envelope`'s correlation id, if any.
    fn fire_pending(&self, envelope: Envelope) -> bool {
        if envelope.correlation_id.is_empty() {
            return false;
        }
        let call = self
            .pending
            .lock()
            .ok()
            .and_then(|mut p| p.resolve(&envelope.correlation_id));
        let Some(call) = call else {
            return false;
        };

        trace!("reply {:?} on {} after {:?}", envelope.kind, self.id, call.elapsed());
        let callback = call.into_callback();
        let kind = envelope.kind.clone();
        tokio::spawn(async move {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || callback(envelope)));
            if outcome.is_err() {
                warn!("reply callback for {kind:?} panicked");
            }
        });
        true
    }

    /// Hand a non-reply envelope to its route without waiting.
    fn route(
        self: &Arc<Self>,
        request: Envelope,
        handlers: &TaskTracker,
        lane: &mpsc::Sender<(RouteHandler, Envelope)>,
    ) {
        let route = self
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(&request.kind).cloned());
        let Some(route) = route else {
            trace!("no route for {:?} on {}", request.kind, self.id);
            return;
        };

        if !route.in_order {
            let client = Arc::clone(self);
            handlers.spawn(async move { client.handle(route.handler, request).await });
            return;
        }
        match lane.try_send((route.handler, request)) {
            Ok(()) => {}
            Err(TrySendError::Full((_, request))) => {
                warn!("dropping {:?} on {}: handler lane full", request.kind, self.id);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn run_in_order(self: Arc<Self>, mut lane: mpsc::Receiver<(RouteHandler, Envelope)>) {
        while let Some((handler, request)) = lane.recv().await {
            self.handle(handler, request).await;
        }
    }

    /// Run one handler, isolating panics, and write its reply.
    async fn handle(&self, handler: RouteHandler, request: Envelope) {
        let ids = Envelope {
            correlation_id: request.correlation_id.clone(),
            session_id: request.session_id.clone(),
            ..Envelope::default()
        };
        let kind = request.kind.clone();
        let outcome = AssertUnwindSafe(async move { handler(request).await })
            .catch_unwind()
            .await;

        let reply = match outcome {
            Ok(reply) => reply,
            Err(_) => {
                warn!("handler for {kind:?} panicked on {}", self.id);
                return;
            }
        };
        if reply.is_noop() {
            return;
        }
        if let Err(e) = self.post(&reply.in_reply_to(&ids)).await {
            debug!("reply to {kind:?} on {} failed: {e}", self.id);
        }
    }
}

async fn next_frame<St>(
    frames: &mut St,
    limit: Option<Duration>,
) -> Result<Option<Result<String, RelayError>>, tokio::time::error::Elapsed>
where
    St: Stream<Item = Result<String, RelayError>> + Unpin,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, frames.next()).await,
        None => Ok(frames.next().await),
    }
}

// ── Line transport ───────────────────────────────────────────────

/// Frame envelopes as newline-delimited JSON over any byte stream,
/// such as a TCP socket between a relay and a coordinator.
pub fn line_transport<T>(
    io: T,
) -> (
    impl Sink<String, Error = RelayError> + Send,
    impl Stream<Item = Result<String, RelayError>> + Send + Unpin,
)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (sink, stream) =
        Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)).split::<String>();
    (
        sink.sink_map_err(RelayError::from),
        stream.map(|line| line.map_err(RelayError::from)),
    )
}

// ── Tests ────────────────────────────────────────────────────────
