//! Client for the application discovery registry.
//!
//! The registry is a small HTTP JSON service. A relay registers its
//! application at startup, keeps a local copy of every registered
//! application up to date by polling, and removes itself on shutdown.
//! Registry failures are logged and never stop the relay.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vmcast_core::RelayError;

use crate::config::RelayConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One registered application instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppMeta {
    pub id: String,
    pub app_name: String,
    pub addr: String,
    pub app_mode: String,
    pub has_chat: bool,
    pub page_title: String,
    pub screen_width: u32,
    pub screen_height: u32,
}

impl AppMeta {
    pub fn from_config(config: &RelayConfig) -> Self {
        let app = &config.app;
        Self {
            id: String::new(),
            app_name: app.name.clone(),
            addr: app.instance_addr.clone(),
            app_mode: app.mode.clone(),
            has_chat: app.has_chat,
            page_title: app.page_title.clone(),
            screen_width: app.screen_width,
            screen_height: app.screen_height,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AppList {
    #[serde(default)]
    apps: Vec<AppMeta>,
}

fn http_err(e: reqwest::Error) -> RelayError {
    RelayError::Transport(format!("discovery: {e}"))
}

// ── DiscoveryClient ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    http: reqwest::Client,
    host: String,
}

impl DiscoveryClient {
    pub fn new(host: &str) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(http_err)?;
        Ok(Self {
            http,
            host: host.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.host)
    }

    /// Register `meta` and return the id the registry assigned.
    pub async fn register(&self, meta: &AppMeta) -> Result<String, RelayError> {
        let id = self
            .http
            .post(self.url("/register"))
            .json(meta)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?
            .json::<String>()
            .await
            .map_err(http_err)?;
        info!("registered {} as {id}", meta.app_name);
        Ok(id)
    }

    pub async fn remove(&self, id: &str) -> Result<(), RelayError> {
        self.http
            .post(self.url("/remove"))
            .json(id)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?;
        info!("removed {id} from discovery");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<AppMeta>, RelayError> {
        let list = self
            .http
            .get(self.url("/get-apps"))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?
            .json::<AppList>()
            .await
            .map_err(http_err)?;
        Ok(list.apps)
    }
}

// ── AppDirectory ─────────────────────────────────────────────────

/// Local copy of the registry's application list.
#[derive(Debug, Clone, Default)]
pub struct AppDirectory {
    apps: Arc<RwLock<Vec<AppMeta>>>,
}

impl AppDirectory {
    pub fn apps(&self) -> Vec<AppMeta> {
        self.apps.read().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn find(&self, id: &str) -> Option<AppMeta> {
        self.apps
            .read()
            .ok()
            .and_then(|apps| apps.iter().find(|a| a.id == id).cloned())
    }

    /// Replace the list. Returns whether anything changed.
    pub fn replace(&self, apps: Vec<AppMeta>) -> bool {
        let Ok(mut current) = self.apps.write() else {
            return false;
        };
        if *current == apps {
            return false;
        }
        *current = apps;
        true
    }
}

/// Refresh `directory` from the registry every `interval` until
/// `shutdown` fires.
pub async fn poll(
    client: DiscoveryClient,
    directory: AppDirectory,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        match client.list().await {
            Ok(apps) => {
                let count = apps.len();
                if directory.replace(apps) {
                    info!("discovery lists {count} app(s)");
                }
            }
            Err(e) => warn!("discovery poll failed: {e}"),
        }
    }
    debug!("discovery poll stopped");
}

// ── Tests ────────────────────────────────────────────────────────
