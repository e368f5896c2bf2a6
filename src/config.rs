use crate::state::LogicalKey;
use std::time::Duration;
use url::Url;

/// Environment variable holding the WebSocket base address.
pub const ENV_WS_BASE: &str = "STREAM_WS_BASE";
/// Environment variable holding an optional path prefix (e.g. `/api/v1`).
pub const ENV_API_PREFIX: &str = "STREAM_API_PREFIX";
/// Environment variable holding an optional bearer token.
pub const ENV_TOKEN: &str = "STREAM_TOKEN";

const DEFAULT_WS_BASE: &str = "ws://localhost:8000";

/// Configuration for the multiplexed stream manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Per-key connection settings
    pub stream: StreamConfig,
    /// How long teardown waits for a disposed connection task before aborting it
    pub close_grace_period: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            close_grace_period: Duration::from_secs(2),
        }
    }
}

impl ManagerConfig {
    /// Create a new builder for configuration
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }
}

/// Builder for ManagerConfig
#[derive(Debug, Clone, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Set per-key connection configuration
    pub fn stream(mut self, config: StreamConfig) -> Self {
        self.config.stream = config;
        self
    }

    /// Set backoff configuration for every key
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.stream.backoff = config;
        self
    }

    /// Set the maximum number of reconnection attempts per key
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.stream.max_reconnect_attempts = attempts;
        self
    }

    /// Set the connect timeout per attempt
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream.connect_timeout = timeout;
        self
    }

    /// Set the teardown grace period
    pub fn close_grace_period(mut self, period: Duration) -> Self {
        self.config.close_grace_period = period;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<ManagerConfig, ConfigError> {
        self.config.stream.validate()?;
        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid connect timeout
    #[error("Invalid connect timeout: {0}")]
    InvalidTimeout(String),
    /// Endpoint base address is unusable
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Settings for one logical stream's connection lifecycle
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Reconnection attempts allowed after a close or failure before
    /// settling into `Failed`. Reset on every successful open.
    pub max_reconnect_attempts: u32,
    /// Delay strategy between attempts
    pub backoff: BackoffConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 10,
            backoff: BackoffConfig::fixed(Duration::from_secs(2)),
        }
    }
}

impl StreamConfig {
    /// Fixed delay between attempts, bounded attempt count.
    pub fn fixed(delay: Duration, max_reconnect_attempts: u32) -> Self {
        Self {
            max_reconnect_attempts,
            backoff: BackoffConfig::fixed(delay),
            ..Self::default()
        }
    }

    /// Vehicle count streams: 5s between attempts, 3 attempts.
    pub fn traffic_info() -> Self {
        Self::fixed(Duration::from_secs(5), 3)
    }

    /// Camera frame streams: 2s between attempts, 5 attempts.
    pub fn frames() -> Self {
        Self::fixed(Duration::from_secs(2), 5)
    }

    /// Interactive chat: exponential backoff from 1s capped at 10s, 10 attempts.
    pub fn chat() -> Self {
        Self {
            max_reconnect_attempts: 10,
            backoff: BackoffConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter: false,
            },
            ..Self::default()
        }
    }

    /// Check the settings are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "connect_timeout must be > 0".to_string(),
            ));
        }

        if self.backoff.max_delay < self.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if self.backoff.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 for a constant delay)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl BackoffConfig {
    /// Constant delay, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}

/// Builds the dashboard's stream addresses from one base URL.
///
/// Keys are percent-encoded as a single path segment; the token, if any,
/// is appended as a `token` query parameter once per address.
#[derive(Debug, Clone)]
pub struct Endpoints {
    ws_base: Url,
    api_prefix: String,
    token: Option<String>,
}

impl Endpoints {
    /// Create endpoints rooted at a `ws://` or `wss://` base address.
    pub fn new(ws_base: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(ws_base)
            .map_err(|e| ConfigError::InvalidEndpoint(format!("{}: {}", ws_base, e)))?;

        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ConfigError::InvalidEndpoint(format!(
                    "unsupported scheme '{}' (expected ws or wss)",
                    other
                )))
            }
        }

        if parsed.cannot_be_a_base() || parsed.host_str().is_none() {
            return Err(ConfigError::InvalidEndpoint(format!(
                "{} cannot be used as a base address",
                ws_base
            )));
        }

        Ok(Self {
            ws_base: parsed,
            api_prefix: String::new(),
            token: None,
        })
    }

    /// Load endpoints from `STREAM_WS_BASE`, `STREAM_API_PREFIX` and `STREAM_TOKEN`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base = lookup(ENV_WS_BASE)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WS_BASE.to_string());

        let mut endpoints = Self::new(base.trim())?;
        if let Some(prefix) = lookup(ENV_API_PREFIX) {
            endpoints = endpoints.with_api_prefix(prefix);
        }
        if let Some(token) = lookup(ENV_TOKEN).filter(|t| !t.is_empty()) {
            endpoints = endpoints.with_token(token);
        }
        Ok(endpoints)
    }

    /// Prefix inserted between the base and every stream path (e.g. `/api/v1`).
    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    /// Bearer token appended to every address.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Vehicle count stream for one road.
    pub fn info_address(&self, key: &LogicalKey) -> String {
        self.address(&["ws", "info", key.as_str()])
    }

    /// Camera frame stream for one road.
    pub fn frames_address(&self, key: &LogicalKey) -> String {
        self.address(&["ws", "frames", key.as_str()])
    }

    /// Interactive chat channel.
    pub fn chat_address(&self) -> String {
        self.address(&["ws", "chat"])
    }

    fn address(&self, segments: &[&str]) -> String {
        let mut url = self.ws_base.clone();
        // Base was checked in new(), so path segments are always available
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(self.api_prefix.split('/').filter(|s| !s.is_empty()));
            path.extend(segments);
        }
        if let Some(ref token) = self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        url.to_string()
    }
}
