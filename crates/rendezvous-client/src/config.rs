use std::env;
use std::time::Duration;

const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_ICE_GATHERING_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_MAX_ROTATION_ATTEMPTS: u32 = 5;
const DEFAULT_BUFFER_MAX_SIZE: usize = 100;
const DEFAULT_BUFFER_MAX_AGE_MS: u64 = 60_000;
const DEFAULT_MAX_OFFERS: usize = 5;
const DEFAULT_OFFER_TTL_MS: u64 = 300_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_DISCOVER_LIMIT: usize = 10;

/// Parameters for an [`ExponentialBackoff`](crate::backoff::ExponentialBackoff).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay (0..=1) applied as symmetric random jitter.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    pub max_size: usize,
    pub max_age: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_BUFFER_MAX_SIZE,
            max_age: Duration::from_millis(DEFAULT_BUFFER_MAX_AGE_MS),
        }
    }
}

/// Per-connection behaviour shared by offerers and answerers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub connection_timeout: Duration,
    pub ice_gathering_timeout: Duration,
    /// Ignored for offerers, which recover through rotation instead.
    pub reconnect_enabled: bool,
    /// Zero means unlimited.
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: BackoffConfig,
    pub buffer_enabled: bool,
    pub buffer: BufferConfig,
    pub preserve_buffer_on_close: bool,
    pub max_rotation_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            ice_gathering_timeout: Duration::from_millis(DEFAULT_ICE_GATHERING_TIMEOUT_MS),
            reconnect_enabled: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_backoff: BackoffConfig::default(),
            buffer_enabled: true,
            buffer: BufferConfig::default(),
            preserve_buffer_on_close: false,
            max_rotation_attempts: DEFAULT_MAX_ROTATION_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_offers: usize,
    pub offer_ttl: Duration,
    pub refill_backoff: BackoffConfig,
    pub connection: ConnectionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_offers: DEFAULT_MAX_OFFERS,
            offer_ttl: Duration::from_millis(DEFAULT_OFFER_TTL_MS),
            refill_backoff: BackoffConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollingConfig {
    pub interval: Duration,
    pub error_backoff: BackoffConfig,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            error_backoff: BackoffConfig::default(),
        }
    }
}

/// Options for [`RendezvousClient`](crate::client::RendezvousClient).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    pub polling: PollingConfig,
    /// Applied to connections opened with `connect`.
    pub connection: ConnectionConfig,
    pub discover_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            polling: PollingConfig::default(),
            connection: ConnectionConfig::default(),
            discover_limit: DEFAULT_DISCOVER_LIMIT,
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with any `RENDEZVOUS_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("RENDEZVOUS_CONNECTION_TIMEOUT_MS") {
            config.connection.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("RENDEZVOUS_ICE_GATHERING_TIMEOUT_MS") {
            config.connection.ice_gathering_timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = env_flag("RENDEZVOUS_RECONNECT") {
            config.connection.reconnect_enabled = enabled;
        }
        if let Some(attempts) = env_parse("RENDEZVOUS_MAX_RECONNECT_ATTEMPTS") {
            config.connection.max_reconnect_attempts = attempts;
        }
        if let Some(enabled) = env_flag("RENDEZVOUS_BUFFER") {
            config.connection.buffer_enabled = enabled;
        }
        if let Some(size) = env_parse("RENDEZVOUS_BUFFER_MAX_SIZE") {
            config.connection.buffer.max_size = size;
        }
        if let Some(ms) = env_parse::<u64>("RENDEZVOUS_BUFFER_MAX_AGE_MS") {
            config.connection.buffer.max_age = Duration::from_millis(ms);
        }
        if let Some(max) = env_parse("RENDEZVOUS_MAX_OFFERS") {
            config.pool.max_offers = max;
        }
        if let Some(ms) = env_parse::<u64>("RENDEZVOUS_OFFER_TTL_MS") {
            config.pool.offer_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("RENDEZVOUS_POLL_INTERVAL_MS") {
            config.polling.interval = Duration::from_millis(ms);
        }

        // Pooled offerers share the connection knobs.
        config.pool.connection = config.connection.clone();
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}
