//! Session configuration.

use std::time::Duration;

use crate::reconnect::Backoff;

/// Expected value of the `cache_version` handshake marker.
pub const EXPECTED_CACHE_VERSION: &str = "v16-giraffe";

/// Expected value of the `cache_ts_version` handshake marker.
pub const EXPECTED_CACHE_TS_VERSION: &str = "v2-bunny";

/// Configuration for a real-time messaging session.
#[derive(Clone, Debug)]
pub struct RtmConfig {
    // Handshake
    /// Base URL of the web API hosting the handshake method.
    pub api_url: String,
    /// Bearer token sent with the handshake call.
    pub token: String,
    /// Expected `cache_version` marker.
    pub expected_cache_version: String,
    /// Expected `cache_ts_version` marker.
    pub expected_cache_ts_version: String,
    /// Timeout for each handshake step (HTTP call, socket open, hello).
    pub connect_timeout: Duration,

    // Reconnection settings
    /// Initial delay before the second dial attempt.
    pub reconnect_initial_delay: Duration,
    /// Maximum delay between dial attempts.
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier for dial delays.
    pub reconnect_backoff_factor: f64,
    /// Random jitter factor (0.0-1.0) for dial delays.
    pub reconnect_jitter: f64,
    /// Maximum number of consecutive failed dials (None = infinite).
    pub reconnect_max_attempts: Option<u32>,
    /// Refresh the directory and membership from every new snapshot,
    /// not only the first one.
    pub reseed_on_reconnect: bool,

    // Keepalive
    /// Silence after which a ping is sent.
    pub keepalive_interval: Duration,
    /// Extra silence tolerated on top of `keepalive_interval` before the
    /// read pump gives up on the connection.
    pub read_grace: Duration,
    /// How long one frame write may block before the link is considered dead.
    pub write_timeout: Duration,

    // Request handling
    /// How long a request waits for its correlated reply.
    pub request_timeout: Duration,
    /// Maximum number of requests waiting for replies.
    pub max_pending_requests: usize,

    // Channels
    /// Capacity of the outbound frame queue.
    pub send_queue_capacity: usize,
    /// Capacity of the membership actor's request queue.
    pub membership_queue_capacity: usize,
}

impl Default for RtmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://slack.com/api".to_string(),
            token: String::new(),
            expected_cache_version: EXPECTED_CACHE_VERSION.to_string(),
            expected_cache_ts_version: EXPECTED_CACHE_TS_VERSION.to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_backoff_factor: 2.0,
            reconnect_jitter: 0.1,
            reconnect_max_attempts: None,
            reseed_on_reconnect: true,
            keepalive_interval: Duration::from_secs(300),
            read_grace: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            max_pending_requests: 1000,
            send_queue_capacity: 256,
            membership_queue_capacity: 256,
        }
    }
}

impl RtmConfig {
    /// Create a new configuration with the given token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }

    /// Set the web API base URL.
    #[must_use]
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Set the handshake step timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnection initial delay.
    #[must_use]
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = delay;
        self
    }

    /// Set the maximum reconnection delay.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the reconnection backoff factor.
    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    /// Set the reconnection jitter.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the maximum consecutive failed dials.
    #[must_use]
    pub fn reconnect_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.reconnect_max_attempts = attempts;
        self
    }

    /// Set whether every reconnect refreshes the directory.
    #[must_use]
    pub fn reseed_on_reconnect(mut self, reseed: bool) -> Self {
        self.reseed_on_reconnect = reseed;
        self
    }

    /// Set the keepalive interval.
    #[must_use]
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the read grace period.
    #[must_use]
    pub fn read_grace(mut self, grace: Duration) -> Self {
        self.read_grace = grace;
        self
    }

    /// Set the per-frame write timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the maximum pending requests.
    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    /// Set the outbound queue capacity.
    #[must_use]
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    /// Set the membership actor's queue capacity.
    #[must_use]
    pub fn membership_queue_capacity(mut self, capacity: usize) -> Self {
        self.membership_queue_capacity = capacity;
        self
    }

    /// Maximum silence tolerated on a connection before it is dropped.
    pub fn read_deadline(&self) -> Duration {
        self.keepalive_interval + self.read_grace
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.api_url.is_empty() {
            return Err("API URL cannot be empty".to_string());
        }
        if self.token.is_empty() {
            return Err("Token cannot be empty".to_string());
        }
        Backoff::from_config(self).validate()?;
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.keepalive_interval.is_zero() {
            return Err("Keepalive interval must be > 0".to_string());
        }
        if self.read_grace.is_zero() {
            return Err("Read grace must be > 0".to_string());
        }
        if self.write_timeout.is_zero() {
            return Err("Write timeout must be > 0".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("Request timeout must be > 0".to_string());
        }
        if self.max_pending_requests == 0 {
            return Err("Max pending requests must be > 0".to_string());
        }
        if self.send_queue_capacity == 0 {
            return Err("Send queue capacity must be > 0".to_string());
        }
        if self.membership_queue_capacity == 0 {
            return Err("Membership queue capacity must be > 0".to_string());
        }
        Ok(())
    }
}
