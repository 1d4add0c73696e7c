use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Result, StatsError};

const DEFAULT_STATS_BASE_URL: &str = "https://stats.modxvm.com/ru/stat/players/";

const ENV_DEVTOOLS_URL: &str = "WOT_XVM_CHROME_DEVTOOLS_URL";
const ENV_HTTP_TIMEOUT: &str = "WOT_XVM_HTTP_TIMEOUT";
const ENV_DEVTOOLS_TIMEOUT: &str = "WOT_XVM_DEVTOOLS_TIMEOUT";
const ENV_STATS_BASE_URL: &str = "WOT_XVM_STATS_BASE_URL";

/// Settings shared by the page scraper and the remote browser controller.
///
/// Durations deserialize from human-readable strings such as `"10s"` or
/// `"1m 30s"`.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Chrome DevTools control-plane URL, e.g. `http://chrome:9222/json/version`.
    pub devtools_url: String,

    /// Timeout for a single plain HTTP call (stats page, endpoint discovery).
    #[serde(default = "default_timeout", deserialize_with = "human_duration")]
    pub http_timeout: Duration,

    /// Deadline for the whole browser automation: session open, navigation
    /// and every screenshot.
    #[serde(default = "default_timeout", deserialize_with = "human_duration")]
    pub devtools_timeout: Duration,

    /// Player account ids are appended to this URL.
    #[serde(default = "default_stats_base_url")]
    pub stats_base_url: String,

    #[serde(default)]
    pub viewport: ViewportConfig,
}

/// Browser viewport applied before navigating. Tall enough that every
/// stacked chart on the stats page is laid out at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ViewportConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 7666,
        }
    }
}

impl SyncConfig {
    pub fn new(devtools_url: impl Into<String>) -> Self {
        Self {
            devtools_url: devtools_url.into(),
            http_timeout: default_timeout(),
            devtools_timeout: default_timeout(),
            stats_base_url: default_stats_base_url(),
            viewport: ViewportConfig::default(),
        }
    }

    /// Build the configuration from `WOT_XVM_*` environment variables.
    /// Only the control-plane URL is required.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let devtools_url = lookup(ENV_DEVTOOLS_URL)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| StatsError::Config(format!("{ENV_DEVTOOLS_URL} is required")))?;

        let mut config = Self::new(devtools_url);
        if let Some(raw) = lookup(ENV_HTTP_TIMEOUT) {
            config.http_timeout = parse_duration(ENV_HTTP_TIMEOUT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_DEVTOOLS_TIMEOUT) {
            config.devtools_timeout = parse_duration(ENV_DEVTOOLS_TIMEOUT, &raw)?;
        }
        if let Some(base) = lookup(ENV_STATS_BASE_URL) {
            config.stats_base_url = base;
        }
        Ok(config)
    }

    /// The stats page for one player. The scraper and the browser must both
    /// use this so that DOM anchor ids agree between the two.
    pub fn stats_page_url(&self, account_id: u64) -> String {
        format!("{}{account_id}", self.stats_base_url)
    }
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| StatsError::Config(format!("{key}={raw:?}: {e}")))
}

fn human_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stats_base_url() -> String {
    DEFAULT_STATS_BASE_URL.to_string()
}
