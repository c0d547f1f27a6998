use std::time::Duration;
use tabsync_core::sync_ipc::{default_hub_addr, resolve_session_id, DEFAULT_MAX_FRAME_BYTES};
use url::Url;
use uuid::Uuid;

use crate::backoff::Backoff;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub session_id: String,
    pub client_id: String,
    pub debounce: Duration,
    pub ack_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session_id: "default".to_string(),
            client_id: format!("tab-{}", Uuid::new_v4()),
            debounce: DEFAULT_DEBOUNCE,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `TABSYNC_SESSION_ID`, `TABSYNC_CLIENT_ID`,
    /// `TABSYNC_DEBOUNCE_MS`, `TABSYNC_ACK_TIMEOUT_MS`, `TABSYNC_MAX_ATTEMPTS`,
    /// `TABSYNC_BACKOFF_BASE_MS` and `TABSYNC_BACKOFF_CAP_MS`.
    pub fn from_env() -> Self {
        let mut config = Self {
            session_id: resolve_session_id(),
            ..Self::default()
        };
        if let Some(client_id) = env_string("TABSYNC_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(ms) = env_u64("TABSYNC_DEBOUNCE_MS") {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("TABSYNC_ACK_TIMEOUT_MS") {
            config.ack_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(attempts) = env_u64("TABSYNC_MAX_ATTEMPTS") {
            config.max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX).max(1);
        }
        if let Some(ms) = env_u64("TABSYNC_BACKOFF_BASE_MS") {
            config.backoff.base = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_u64("TABSYNC_BACKOFF_CAP_MS") {
            config.backoff.cap = Duration::from_millis(ms.max(1));
        }
        config
    }
}

#[derive(Debug, Clone)]
pub struct HubTransportConfig {
    pub url: Url,
    pub session_id: String,
    pub client_id: String,
    pub ack_timeout: Duration,
    pub reconnect: Backoff,
    pub max_frame_bytes: usize,
    pub queue_capacity: usize,
}

impl HubTransportConfig {
    pub fn new(url: Url, client: &ClientConfig) -> Self {
        Self {
            url,
            session_id: client.session_id.clone(),
            client_id: client.client_id.clone(),
            ack_timeout: client.ack_timeout,
            reconnect: Backoff {
                base: Duration::from_secs(1),
                factor: 2,
                cap: Duration::from_secs(10),
            },
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            queue_capacity: client.channel_capacity,
        }
    }

    /// `TABSYNC_HUB_URL`, else `ws://` + `TABSYNC_HUB_ADDR`, else the
    /// session-derived loopback address.
    pub fn from_env(client: &ClientConfig) -> Result<Self, url::ParseError> {
        let url = resolve_hub_url(&client.session_id)?;
        Ok(Self::new(url, client))
    }
}

pub fn resolve_hub_url(session_id: &str) -> Result<Url, url::ParseError> {
    if let Some(url) = env_string("TABSYNC_HUB_URL") {
        return Url::parse(&url);
    }
    let addr = env_string("TABSYNC_HUB_ADDR").unwrap_or_else(|| default_hub_addr(session_id));
    Url::parse(&format!("ws://{addr}/ws"))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|value| value.parse().ok())
}
