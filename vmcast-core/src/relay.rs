//! Per-client connection wiring.
//!
//! [`Relay`] turns one accepted client connection into a
//! [`PacketClient`], a [`MediaSession`] joined to the broadcaster, and
//! the signaling routes between them. [`ClientConnection::run`] drives
//! the read loop and tears everything down when the client goes away.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::{Sink, Stream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::input::InputEvent;
use crate::protocol::{PacketClient, ProtocolConfig};
use crate::session::{MediaSession, SessionConfig, TransportFactory, routes};

/// Shared state for accepting clients.
pub struct Relay {
    broadcaster: Broadcaster,
    factory: Arc<dyn TransportFactory>,
    input: mpsc::Sender<InputEvent>,
    protocol: ProtocolConfig,
    session: SessionConfig,
    greeting: Vec<Envelope>,
    active: Arc<AtomicUsize>,
}

impl Relay {
    pub fn new(
        broadcaster: Broadcaster,
        factory: Arc<dyn TransportFactory>,
        input: mpsc::Sender<InputEvent>,
        protocol: ProtocolConfig,
        session: SessionConfig,
    ) -> Self {
        Self {
            broadcaster,
            factory,
            input,
            protocol,
            session,
            greeting: Vec::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Envelopes sent to every client right after it connects.
    pub fn with_greeting(mut self, greeting: Vec<Envelope>) -> Self {
        self.greeting = greeting;
        self
    }

    /// Clients currently connected.
    pub fn active_clients(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Set up a client behind the write half `sink`.
    ///
    /// The greeting is sent, the session is registered with the
    /// broadcaster and its routes are attached. Nothing is read until
    /// [`ClientConnection::run`].
    pub async fn connect<S>(&self, sink: S) -> Result<ClientConnection, RelayError>
    where
        S: Sink<String, Error = RelayError> + Send + 'static,
    {
        let client = PacketClient::new(sink, self.protocol.clone());
        for envelope in &self.greeting {
            client.send(envelope.clone(), None).await?;
        }

        let session = MediaSession::new(
            client.id(),
            self.session.clone(),
            Arc::clone(&self.factory),
            Arc::downgrade(&client),
            self.input.clone(),
        );
        self.broadcaster
            .join(
                session.id(),
                session.image_queue(),
                session.audio_queue(),
                session.cancel_token(),
            )
            .await?;
        routes::attach(&session, &client);

        let count = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        info!("client {} connected ({count} active)", client.id());
        Ok(ClientConnection {
            client,
            session,
            broadcaster: self.broadcaster.clone(),
            active: Arc::clone(&self.active),
        })
    }

    /// Serve one client until it disconnects or `shutdown` fires.
    pub async fn serve<S, St>(&self, sink: S, frames: St, shutdown: CancellationToken)
    where
        S: Sink<String, Error = RelayError> + Send + 'static,
        St: Stream<Item = Result<String, RelayError>> + Unpin + Send,
    {
        match self.connect(sink).await {
            Ok(connection) => connection.run(frames, shutdown).await,
            Err(e) => warn!("client setup failed: {e}"),
        }
    }
}

// ── ClientConnection ─────────────────────────────────────────────

/// A connected client and its session.
pub struct ClientConnection {
    client: Arc<PacketClient>,
    session: Arc<MediaSession>,
    broadcaster: Broadcaster,
    active: Arc<AtomicUsize>,
}

impl ClientConnection {
    pub fn client(&self) -> &Arc<PacketClient> {
        &self.client
    }

    pub fn session(&self) -> &Arc<MediaSession> {
        &self.session
    }

    /// Read until the connection ends, then tear the session down.
    pub async fn run<St>(self, frames: St, shutdown: CancellationToken)
    where
        St: Stream<Item = Result<String, RelayError>> + Unpin + Send,
    {
        let heartbeat = tokio::spawn(Arc::clone(&self.client).heartbeat());
        let watcher = {
            let client = Arc::clone(&self.client);
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => client.close(),
                    _ = client.closed() => {}
                }
            })
        };

        Arc::clone(&self.client).listen(frames).await;

        let id = self.session.id().to_string();
        self.session.cancel_token().cancel();
        if let Err(e) = self.broadcaster.leave(&id).await {
            debug!("client {id}: broadcaster already gone: {e}");
        }
        self.session.close().await;

        let _ = heartbeat.await;
        let _ = watcher.await;
        let count = self.active.fetch_sub(1, Ordering::Relaxed) - 1;
        info!("client {id} disconnected ({count} active)");
    }
}
