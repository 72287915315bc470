//! Gateway configuration

use std::fmt;
use std::path::PathBuf;

/// Configuration for the Courier gateway
#[derive(Clone)]
pub struct GatewayConfig {
    /// Base URL of the homeserver, e.g. `https://matrix.example.org`
    pub homeserver_url: String,

    /// Full user id of the gateway account, e.g. `@courier:example.org`
    pub user_id: String,

    /// Account password, used only when no stored session can be resumed
    pub password: String,

    /// Device display name registered on login
    /// Default: "courier-gateway"
    pub device_name: String,

    /// Channel that receives deliveries without an explicit recipient.
    /// If None, recipient-less deliveries are rejected at ingestion.
    pub management_channel: Option<String>,

    /// Shared secret required in the ingestion `Api-Key` header.
    /// If None, the ingestion endpoint accepts unauthenticated requests.
    pub api_key: Option<String>,

    /// Path to the session database file
    /// If None, uses a default path in the user's data directory
    pub db_path: Option<PathBuf>,

    /// Maximum retries for a transient delivery failure before it is
    /// converted to a fatal one
    /// Default: 5
    pub max_retry_attempts: u32,

    /// Base delay for exponential retry backoff (milliseconds)
    /// Default: 500
    pub base_backoff_ms: u64,

    /// Upper bound on the retry backoff delay (milliseconds)
    /// Default: 30_000
    pub max_backoff_ms: u64,

    /// Timeout for each network call to the messaging service (seconds)
    /// Default: 10
    pub request_timeout_secs: u64,

    /// Long-poll timeout for the synchronization stream (milliseconds)
    /// Default: 30_000
    pub sync_timeout_ms: u64,

    /// How long shutdown waits for in-flight sends to finish (seconds)
    /// Default: 5
    pub drain_timeout_secs: u64,

    /// Capacity of the bounded sync event stream
    /// Default: 1024
    pub event_buffer: usize,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("homeserver_url", &self.homeserver_url)
            .field("user_id", &self.user_id)
            .field("password", &"[REDACTED]")
            .field("device_name", &self.device_name)
            .field("management_channel", &self.management_channel)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("db_path", &self.db_path)
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("base_backoff_ms", &self.base_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("sync_timeout_ms", &self.sync_timeout_ms)
            .field("drain_timeout_secs", &self.drain_timeout_secs)
            .field("event_buffer", &self.event_buffer)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            homeserver_url: String::new(),
            user_id: String::new(),
            password: String::new(),
            device_name: "courier-gateway".to_string(),
            management_channel: None,
            api_key: None,
            db_path: None,
            max_retry_attempts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            request_timeout_secs: 10,
            sync_timeout_ms: 30_000,
            drain_timeout_secs: 5,
            event_buffer: 1024,
        }
    }
}

impl GatewayConfig {
    /// Create a config for the given account
    pub fn new(
        homeserver_url: impl Into<String>,
        user_id: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            homeserver_url: homeserver_url.into(),
            user_id: user_id.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Set the device display name
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set the management channel for recipient-less deliveries
    pub fn with_management_channel(mut self, channel: impl Into<String>) -> Self {
        self.management_channel = Some(channel.into());
        self
    }

    /// Set the ingestion shared secret
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the session database path
    pub fn with_db_path(mut self, path: PathBuf) -> Self {
        self.db_path = Some(path);
        self
    }

    /// Set the maximum transient retry count
    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Set the base backoff delay
    pub fn with_base_backoff_ms(mut self, ms: u64) -> Self {
        self.base_backoff_ms = ms;
        self
    }

    /// Set the backoff cap
    pub fn with_max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    /// Set the per-call network timeout
    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Set the sync long-poll timeout
    pub fn with_sync_timeout_ms(mut self, ms: u64) -> Self {
        self.sync_timeout_ms = ms;
        self
    }

    /// Set the shutdown drain timeout
    pub fn with_drain_timeout(mut self, secs: u64) -> Self {
        self.drain_timeout_secs = secs;
        self
    }

    /// Configuration for testing (tight timeouts, fast backoff)
    pub fn for_testing() -> Self {
        Self {
            homeserver_url: "http://localhost:1".to_string(),
            user_id: "@courier:example.org".to_string(),
            password: "test-password".to_string(),
            device_name: "courier-test".to_string(),
            management_channel: Some("!management:example.org".to_string()),
            api_key: None,
            db_path: None,
            max_retry_attempts: 3,
            base_backoff_ms: 10,
            max_backoff_ms: 100,
            request_timeout_secs: 1,
            sync_timeout_ms: 50,
            drain_timeout_secs: 1,
            event_buffer: 64,
        }
    }
}
