//! Relay to the input-injection agent.
//!
//! The agent dials in over TCP. `AgentRelay` owns the single live
//! `AgentLink` inside one control loop: it accepts connections (a new
//! one supersedes the old), pings with a zero byte every half keepalive
//! period, and writes input frames while the link is [`Readiness::Ready`].
//! Events arriving while `NotReady` are dropped, never queued.

pub mod client;

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{AgentCodec, AgentFrame, ScreenSize};
use crate::error::RelayError;
use crate::input::InputEvent;

pub use client::AgentClient;

/// Default keepalive period. Pings go out every half period.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);

// ── Readiness ────────────────────────────────────────────────────

/// Whether the agent can take input right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Readiness {
    #[default]
    NotReady,
    Ready,
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotReady => write!(f, "not ready"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

// ── AgentConfig ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub keepalive: Duration,
    /// Bound on a single frame write before the link is declared dead.
    pub write_timeout: Duration,
    /// The application's real screen, for pointer rescaling.
    pub screen: ScreenSize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            keepalive: DEFAULT_KEEPALIVE,
            write_timeout: Duration::from_secs(2),
            screen: ScreenSize::default(),
        }
    }
}

// ── AgentLink ────────────────────────────────────────────────────

/// The one live agent connection.
struct AgentLink {
    peer: SocketAddr,
    generation: u64,
    writer: FramedWrite<OwnedWriteHalf, AgentCodec>,
    reader: JoinHandle<()>,
}

impl AgentLink {
    fn open(stream: TcpStream, peer: SocketAddr, generation: u64, lost: mpsc::Sender<u64>) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("agent {peer}: cannot disable nagle: {e}");
        }
        let (read, write) = stream.into_split();
        let reader = tokio::spawn(watch_reader(read, generation, lost));
        Self {
            peer,
            generation,
            writer: FramedWrite::new(write, AgentCodec),
            reader,
        }
    }

    async fn send(&mut self, frame: AgentFrame, deadline: Duration) -> Result<(), RelayError> {
        tokio::time::timeout(deadline, self.writer.send(frame))
            .await
            .map_err(|_| RelayError::Timeout(deadline))?
    }
}

impl Drop for AgentLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Report the link lost once the agent's side of the socket ends.
async fn watch_reader(read: OwnedReadHalf, generation: u64, lost: mpsc::Sender<u64>) {
    let mut frames = FramedRead::new(read, AgentCodec);
    loop {
        match frames.next().await {
            Some(Ok(frame)) => trace!("agent sent {frame:?}"),
            Some(Err(e)) => {
                debug!("agent read failed: {e}");
                break;
            }
            None => break,
        }
    }
    let _ = lost.send(generation).await;
}

// ── AgentRelay ───────────────────────────────────────────────────

/// Listens for the agent and relays input events to it.
#[derive(Debug)]
pub struct AgentRelay {
    listener: TcpListener,
    config: AgentConfig,
    readiness: watch::Sender<Readiness>,
}

impl AgentRelay {
    pub async fn bind(addr: SocketAddr, config: AgentConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        info!("agent relay listening on {}", listener.local_addr()?);
        let (readiness, _) = watch::channel(Readiness::NotReady);
        Ok(Self {
            listener,
            config,
            readiness,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Observe readiness changes.
    pub fn readiness(&self) -> watch::Receiver<Readiness> {
        self.readiness.subscribe()
    }

    fn set_readiness(&self, next: Readiness) {
        let changed = self.readiness.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!("agent {next}");
        }
    }

    /// Run the accept, keepalive and forwarding loop until `shutdown`
    /// fires or the event queue closes.
    pub async fn run(self, mut events: mpsc::Receiver<InputEvent>, shutdown: CancellationToken) {
        let mut ping = tokio::time::interval(self.config.keepalive / 2);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let (lost_tx, mut lost_rx) = mpsc::channel(4);
        let mut link: Option<AgentLink> = None;
        let mut generation = 0u64;
        let mut dropped = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("agent accept failed: {e}");
                            continue;
                        }
                    };
                    if let Some(old) = link.take() {
                        info!("agent {peer} supersedes {}", old.peer);
                    } else {
                        info!("agent connected from {peer}");
                    }
                    generation += 1;
                    link = Some(AgentLink::open(stream, peer, generation, lost_tx.clone()));
                    self.set_readiness(Readiness::Ready);
                }

                Some(lost) = lost_rx.recv() => {
                    if link.as_ref().is_some_and(|l| l.generation == lost) {
                        info!("agent connection closed");
                        link = None;
                        self.set_readiness(Readiness::NotReady);
                    }
                }

                _ = ping.tick() => {
                    if let Some(active) = link.as_mut() {
                        if let Err(e) = active.send(AgentFrame::Keepalive, self.config.write_timeout).await {
                            warn!("agent keepalive failed: {e}");
                            link = None;
                            self.set_readiness(Readiness::NotReady);
                        }
                    }
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("input queue closed");
                        break;
                    };
                    let Some(active) = link.as_mut() else {
                        dropped += 1;
                        trace!("agent not ready, dropping input");
                        continue;
                    };
                    let frame = match event.into_frame(self.config.screen) {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!("dropping input: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = active.send(frame, self.config.write_timeout).await {
                        warn!("agent write failed: {e}");
                        link = None;
                        self.set_readiness(Readiness::NotReady);
                    }
                }
            }
        }

        drop(link);
        self.set_readiness(Readiness::NotReady);
        info!("agent relay stopped ({dropped} event(s) dropped while not ready)");
    }
}

// ── Tests ────────────────────────────────────────────────────────
