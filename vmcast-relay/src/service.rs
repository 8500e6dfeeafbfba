//! The relay service: capture listeners, broadcaster, agent relay,
//! websocket endpoint and discovery, under one shutdown token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vmcast_core::{
    AgentRelay, Broadcaster, Envelope, MediaKind, PacketPool, Readiness, Relay, RelayError,
    RtpListener, kinds,
};

use crate::config::RelayConfig;
use crate::discovery::{self, AppDirectory, AppMeta, DiscoveryClient};
use crate::rtc::RtcFactory;
use crate::ws;

/// A started relay.
pub struct RunningRelay {
    pub http_addr: SocketAddr,
    pub agent_addr: SocketAddr,
    pub video_addr: SocketAddr,
    pub audio_addr: SocketAddr,
    relay: Arc<Relay>,
    readiness: watch::Receiver<Readiness>,
    directory: AppDirectory,
    registration: Option<(DiscoveryClient, String)>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningRelay {
    pub fn readiness(&self) -> watch::Receiver<Readiness> {
        self.readiness.clone()
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Applications currently known to discovery.
    pub fn directory(&self) -> &AppDirectory {
        &self.directory
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for the HTTP server to stop, then stop everything else.
    pub async fn wait(self) {
        if let Err(e) = self.server.await {
            error!("http server task failed: {e}");
        }
        self.shutdown.cancel();

        if let Some((client, id)) = &self.registration {
            if let Err(e) = client.remove(id).await {
                warn!("discovery removal failed: {e}");
            }
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("relay stopped");
    }
}

// ── RelayService ─────────────────────────────────────────────────

pub struct RelayService {
    config: RelayConfig,
    shutdown: CancellationToken,
}

impl RelayService {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the service when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token fires.
    pub async fn run(self) -> Result<(), RelayError> {
        let running = self.start().await?;
        running.wait().await;
        Ok(())
    }

    /// Bind every socket and spawn every loop.
    pub async fn start(self) -> Result<RunningRelay, RelayError> {
        bind_all(self.config, self.shutdown).await
    }
}

/// Payload of the `INIT` greeting.
#[derive(Debug, Serialize)]
struct AppGreeting<'a> {
    cur_app_id: &'a str,
    cur_app: AppMeta,
}

/// Envelopes every client receives on connect: the ICE server and the
/// metadata of the application being streamed.
fn greeting(config: &RelayConfig, app_id: &str) -> Result<Vec<Envelope>, RelayError> {
    let mut cur_app = AppMeta::from_config(config);
    cur_app.id = app_id.to_string();
    let meta = serde_json::to_string(&AppGreeting {
        cur_app_id: app_id,
        cur_app,
    })?;
    Ok(vec![
        Envelope::new(kinds::ICE_CONFIG, config.webrtc.stun_turn.clone()),
        Envelope::new(kinds::APP_META, meta),
    ])
}

async fn bind_all(
    config: RelayConfig,
    shutdown: CancellationToken,
) -> Result<RunningRelay, RelayError> {
    let mut tasks = Vec::new();

    // ── Capture ──────────────────────────────────────────────────
    let pool = || PacketPool::new(config.capture.pool_slots, config.capture.slot_size);
    let video = RtpListener::bind(config.video_rtp_addr(), MediaKind::Video, pool()).await?;
    let audio = RtpListener::bind(config.audio_rtp_addr(), MediaKind::Audio, pool()).await?;
    let video_addr = video.local_addr()?;
    let audio_addr = audio.local_addr()?;
    let (video_stream, video_task) = video.spawn(shutdown.clone());
    let (audio_stream, audio_task) = audio.spawn(shutdown.clone());
    tasks.extend([video_task, audio_task]);

    let (broadcaster, fanout_tasks) =
        Broadcaster::spawn(video_stream, audio_stream, shutdown.clone());
    tasks.extend(fanout_tasks);

    // ── Agent ────────────────────────────────────────────────────
    let (input_tx, input_rx) = mpsc::channel(config.session.input_queue_capacity.max(1));
    let agent = AgentRelay::bind(config.agent_addr(), config.to_agent_config()).await?;
    let agent_addr = agent.local_addr()?;
    let readiness = agent.readiness();
    tasks.push(tokio::spawn(agent.run(input_rx, shutdown.clone())));

    // ── Discovery ────────────────────────────────────────────────
    let directory = AppDirectory::default();
    let mut registration = None;
    if config.discovery_enabled() {
        let client = DiscoveryClient::new(&config.discovery.host)?;
        match client.register(&AppMeta::from_config(&config)).await {
            Ok(id) => registration = Some((client.clone(), id)),
            Err(e) => warn!("discovery registration failed: {e}"),
        }
        tasks.push(tokio::spawn(discovery::poll(
            client,
            directory.clone(),
            Duration::from_millis(config.discovery.poll_interval_ms.max(1)),
            shutdown.clone(),
        )));
    }
    let app_id = registration
        .as_ref()
        .map(|(_, id)| id.clone())
        .unwrap_or_default();

    // ── Clients ──────────────────────────────────────────────────
    let relay = Arc::new(
        Relay::new(
            broadcaster,
            Arc::new(RtcFactory::from_config(&config.webrtc)),
            input_tx,
            config.to_protocol_config(),
            config.to_session_config(),
        )
        .with_greeting(greeting(&config, &app_id)?),
    );

    let http_addr = config
        .http_addr()
        .map_err(|e| RelayError::Other(format!("bad http_addr: {e}")))?;
    let listener = TcpListener::bind(http_addr).await?;
    let http_addr = listener.local_addr()?;
    info!("clients connect to ws://{http_addr}{}", ws::WS_PATH);

    let app = ws::router(Arc::clone(&relay), shutdown.clone());
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!("http server error: {e}");
            }
        }
    });

    Ok(RunningRelay {
        http_addr,
        agent_addr,
        video_addr,
        audio_addr,
        relay,
        readiness,
        directory,
        registration,
        shutdown,
        server,
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpStream, UdpSocket};

    fn ephemeral_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.network.http_addr = "127.0.0.1:0".into();
        config.network.agent_port = 0;
        config.network.video_rtp_port = 0;
        config.network.audio_rtp_port = 0;
        config
    }

    #[test]
    fn greeting_carries_full_app_meta() {
        let mut config = RelayConfig::default();
        config.app.name = "notepad".into();
        config.app.page_title = "Notepad".into();
        config.app.has_chat = true;

        let greeting = greeting(&config, "app-7").unwrap();
        assert_eq!(greeting[0].kind, kinds::ICE_CONFIG);
        assert_eq!(greeting[0].payload, config.webrtc.stun_turn);
        assert_eq!(greeting[1].kind, kinds::APP_META);

        let meta: serde_json::Value = serde_json::from_str(&greeting[1].payload).unwrap();
        assert_eq!(meta["cur_app_id"], "app-7");
        let app: AppMeta = serde_json::from_value(meta["cur_app"].clone()).unwrap();
        assert_eq!(app.id, "app-7");
        assert_eq!(app.app_name, "notepad");
        assert_eq!(app.page_title, "Notepad");
        assert!(app.has_chat);
        assert_eq!((app.screen_width, app.screen_height), (800, 600));
    }

    #[tokio::test]
    async fn starts_and_stops_cleanly() {
        let service = RelayService::new(ephemeral_config());
        let shutdown = service.shutdown_token();
        let running = service.start().await.unwrap();
        assert_ne!(running.http_addr.port(), 0);
        assert!(running.video_addr.ip().is_loopback());

        // Plain HTTP on the websocket path is refused.
        let url = format!("http://{}{}", running.http_addr, ws::WS_PATH);
        let status = reqwest::get(&url).await.unwrap().status();
        assert!(status.is_client_error());

        // The agent port accepts the injection agent.
        let mut ready = running.readiness();
        let agent_addr = SocketAddr::from(([127, 0, 0, 1], running.agent_addr.port()));
        let _agent = TcpStream::connect(agent_addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), ready.wait_for(|r| *r == Readiness::Ready))
            .await
            .expect("timeout")
            .unwrap();

        // Capture datagrams are accepted without any client attached.
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rtp = [0x80, 96, 0, 1, 0, 0, 0, 1, 0, 0, 0, 9];
        sender.send_to(&rtp, running.video_addr).await.unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), running.wait())
            .await
            .expect("timeout");
    }
}
