//! Runtime configuration from `GATESYNC_*` environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use gatesync_core::{DEFAULT_GROUP, DEFAULT_VERSION};
use serde::Serialize;
use tracing::warn;

pub const ENV_PREFIX: &str = "GATESYNC_";

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Empty watches every namespace.
    pub namespace: String,
    pub api_group: String,
    pub api_version: String,
    pub api_url: Option<String>,
    #[serde(skip)]
    pub token: Option<String>,
    pub keepalive_ms: u64,
    pub drain_interval_ms: u64,
    pub bootstrap_retry_ms: u64,
    pub open_timeout_ms: u64,
    pub resubscribe_delay_ms: u64,
    pub max_retries: u32,
    pub status_timeout_ms: u64,
    pub webhook_addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: String::new(),
            api_group: DEFAULT_GROUP.to_string(),
            api_version: DEFAULT_VERSION.to_string(),
            api_url: None,
            token: None,
            keepalive_ms: 5000,
            drain_interval_ms: 1000,
            bootstrap_retry_ms: 5000,
            open_timeout_ms: 10_000,
            resubscribe_delay_ms: 5000,
            max_retries: 3,
            status_timeout_ms: 5000,
            webhook_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            metrics_addr: None,
        }
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("enabled", &self.enabled)
            .field("namespace", &self.namespace)
            .field("api_group", &self.api_group)
            .field("api_version", &self.api_version)
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("keepalive_ms", &self.keepalive_ms)
            .field("drain_interval_ms", &self.drain_interval_ms)
            .field("bootstrap_retry_ms", &self.bootstrap_retry_ms)
            .field("open_timeout_ms", &self.open_timeout_ms)
            .field("resubscribe_delay_ms", &self.resubscribe_delay_ms)
            .field("max_retries", &self.max_retries)
            .field("status_timeout_ms", &self.status_timeout_ms)
            .field("webhook_addr", &self.webhook_addr)
            .field("metrics_addr", &self.metrics_addr)
            .finish()
    }
}

fn flag(v: &str) -> Option<bool> {
    match v.trim() {
        "1" => Some(true),
        "0" => Some(false),
        s if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("yes") => Some(true),
        s if s.eq_ignore_ascii_case("false") || s.eq_ignore_ascii_case("no") => Some(false),
        _ => None,
    }
}

impl SyncConfig {
    pub fn from_env() -> Self { Self::from_lookup(|name| std::env::var(name).ok()) }

    /// Build from an arbitrary variable source (names include the prefix).
    /// Unparseable values fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix)).filter(|v| !v.trim().is_empty());
        let num = |suffix: &str, default: u64| -> u64 { parsed(suffix, get(suffix), default) };
        // Periods drive timers; zero is not a usable period.
        let period = |suffix: &str, default: u64| -> u64 {
            match num(suffix, default) {
                0 => {
                    warn!(var = %format!("{}{}", ENV_PREFIX, suffix), "zero period; keeping default");
                    default
                }
                ms => ms,
            }
        };
        let d = Self::default();
        Self {
            enabled: get("ENABLED")
                .map(|v| {
                    flag(&v).unwrap_or_else(|| {
                        warn!(var = "GATESYNC_ENABLED", value = %v, "invalid flag; keeping default");
                        d.enabled
                    })
                })
                .unwrap_or(d.enabled),
            namespace: get("NAMESPACE").unwrap_or(d.namespace),
            api_group: get("API_GROUP").unwrap_or(d.api_group),
            api_version: get("API_VERSION").unwrap_or(d.api_version),
            api_url: get("API_URL"),
            token: get("TOKEN"),
            keepalive_ms: period("KEEPALIVE_MS", d.keepalive_ms),
            drain_interval_ms: period("DRAIN_INTERVAL_MS", d.drain_interval_ms),
            bootstrap_retry_ms: period("BOOTSTRAP_RETRY_MS", d.bootstrap_retry_ms),
            open_timeout_ms: num("OPEN_TIMEOUT_MS", d.open_timeout_ms),
            resubscribe_delay_ms: num("RESUBSCRIBE_DELAY_MS", d.resubscribe_delay_ms),
            max_retries: parsed("MAX_RETRIES", get("MAX_RETRIES"), d.max_retries),
            status_timeout_ms: num("STATUS_TIMEOUT_MS", d.status_timeout_ms),
            webhook_addr: parsed("WEBHOOK_ADDR", get("WEBHOOK_ADDR"), d.webhook_addr),
            metrics_addr: get("METRICS_ADDR").and_then(|v| match v.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!(var = "GATESYNC_METRICS_ADDR", value = %v, "invalid address; metrics disabled");
                    None
                }
            }),
        }
    }

    pub fn keepalive(&self) -> Duration { Duration::from_millis(self.keepalive_ms) }
    pub fn drain_interval(&self) -> Duration { Duration::from_millis(self.drain_interval_ms) }
    pub fn bootstrap_retry(&self) -> Duration { Duration::from_millis(self.bootstrap_retry_ms) }
    pub fn open_timeout(&self) -> Duration { Duration::from_millis(self.open_timeout_ms) }
    pub fn resubscribe_delay(&self) -> Duration { Duration::from_millis(self.resubscribe_delay_ms) }
    pub fn status_timeout(&self) -> Duration { Duration::from_millis(self.status_timeout_ms) }
}

fn parsed<T: FromStr>(suffix: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(var = %format!("{}{}", ENV_PREFIX, suffix), value = %v, "invalid value; keeping default");
            default
        }),
    }
}
