//! Runtime configuration.
//!
//! Deserialisable with per-field defaults, or built from the environment
//! (a `.env` file is loaded first if present).

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BotError, BotResult};
use crate::types::Intents;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Bot token. May be absent when the host logs in with credentials.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,

    /// Base URL of the REST API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// WebSocket URL of the gateway.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Literal command prefix, e.g. `!`.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Also accept `<@bot_id> command` as a prefix.
    #[serde(default = "default_true")]
    pub mention_prefix: bool,

    /// Users allowed to run owner-only commands.
    #[serde(default)]
    pub owner_ids: HashSet<String>,

    /// Gateway intents bitmask.
    #[serde(default = "default_intents")]
    pub intents: u64,

    /// Optional `[shard_id, shard_count]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// REST request timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long `connect` waits for READY.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Per-subscriber event buffer on the bus.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Reconnection policy for the session client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Attempts before giving up and publishing `disconnect`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles per attempt.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Upper bound on the retry delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_api_url() -> String {
    "http://localhost:3000/api".to_string()
}

fn default_gateway_url() -> String {
    "ws://localhost:3000/gateway".to_string()
}

fn default_prefix() -> String {
    "!".to_string()
}

fn default_true() -> bool {
    true
}

fn default_intents() -> u64 {
    Intents::default().bits()
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_ready_timeout_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    crate::bus::DEFAULT_CAPACITY
}

fn default_max_attempts() -> u32 {
    5
}

fn default_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: default_api_url(),
            gateway_url: default_gateway_url(),
            prefix: default_prefix(),
            mention_prefix: default_true(),
            owner_ids: HashSet::new(),
            intents: default_intents(),
            shard: None,
            reconnect: ReconnectConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl BotConfig {
    /// Build from `BOT_*` environment variables, loading `.env` first.
    pub fn from_env() -> BotResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BotResult<Self> {
        let mut config = Self::default();

        config.token = lookup("BOT_TOKEN").filter(|t| !t.trim().is_empty());
        if let Some(url) = lookup("BOT_API_URL") {
            config.api_url = url;
        }
        if let Some(url) = lookup("BOT_GATEWAY_URL") {
            config.gateway_url = url;
        }
        if let Some(prefix) = lookup("BOT_PREFIX") {
            if prefix.trim().is_empty() {
                return Err(BotError::Config("BOT_PREFIX must not be empty".into()));
            }
            config.prefix = prefix;
        }
        if let Some(flag) = lookup("BOT_MENTION_PREFIX") {
            config.mention_prefix = parse_var("BOT_MENTION_PREFIX", &flag)?;
        }
        if let Some(owners) = lookup("BOT_OWNER_IDS") {
            config.owner_ids = owners
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(intents) = lookup("BOT_INTENTS") {
            config.intents = parse_var("BOT_INTENTS", &intents)?;
        }
        if let Some(attempts) = lookup("BOT_MAX_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts = parse_var("BOT_MAX_RECONNECT_ATTEMPTS", &attempts)?;
        }
        if let Some(delay) = lookup("BOT_RECONNECT_DELAY_MS") {
            config.reconnect.delay_ms = parse_var("BOT_RECONNECT_DELAY_MS", &delay)?;
        }

        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn intents(&self) -> Intents {
        Intents::from_bits_truncate(self.intents)
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based): exponential from
    /// `delay_ms`, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1).min(16));
        let ms = self.delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> BotResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BotError::Config(format!("{key} has an invalid value: {value:?}")))
}
