//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parlor_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_SESSION_TTL_HOURS};

use crate::hub::HubConfig;
use crate::presence::RetryPolicy;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket listener.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./parlor.db`
    pub database_path: PathBuf,

    /// Human-readable name for this instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Parlor"`
    pub instance_name: String,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Ed25519 session signing key, 64 hex characters.
    /// Env: `SESSION_SIGNING_KEY`
    /// Default: none, a random key is generated at startup.
    pub session_signing_key: Option<String>,

    /// Env: `SESSION_TTL_HOURS`
    /// Default: `168`
    pub session_ttl_hours: i64,

    /// Env: `PRESENCE_RETRY_ATTEMPTS`, `PRESENCE_RETRY_BASE_MS`
    /// Default: 5 attempts starting at 200 ms.
    pub presence_retry_attempts: u32,
    pub presence_retry_base_ms: u64,

    /// Per-connection outbound queue capacity.
    /// Env: `OUTBOUND_QUEUE`
    /// Default: `256`
    pub outbound_queue: usize,

    /// Maximum friend suggestions returned in one call.
    /// Env: `SUGGESTION_LIMIT`
    /// Default: `50`
    pub suggestion_limit: usize,

    /// Maximum number of concurrent WebSocket connections (0 = unlimited).
    /// Env: `MAX_CONNECTIONS`
    /// Default: `0`
    pub max_connections: usize,

    /// HTTP token bucket: sustained requests per second and burst size.
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parlor.db"),
            instance_name: "Parlor".to_string(),
            admin_token: None,
            session_signing_key: None,
            session_ttl_hours: DEFAULT_SESSION_TTL_HOURS,
            presence_retry_attempts: 5,
            presence_retry_base_ms: 200,
            outbound_queue: 256,
            suggestion_limit: 50,
            max_connections: 0,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("instance_name", &self.instance_name)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field(
                "session_signing_key",
                &self.session_signing_key.as_ref().map(|_| "<redacted>"),
            )
            .field("session_ttl_hours", &self.session_ttl_hours)
            .field("presence_retry_attempts", &self.presence_retry_attempts)
            .field("presence_retry_base_ms", &self.presence_retry_base_ms)
            .field("outbound_queue", &self.outbound_queue)
            .field("suggestion_limit", &self.suggestion_limit)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(key) = lookup("SESSION_SIGNING_KEY") {
            if !key.is_empty() {
                config.session_signing_key = Some(key);
            }
        }

        parse_into(&lookup, "SESSION_TTL_HOURS", &mut config.session_ttl_hours);
        if config.session_ttl_hours <= 0 {
            tracing::warn!(
                value = config.session_ttl_hours,
                "SESSION_TTL_HOURS must be positive, using default"
            );
            config.session_ttl_hours = DEFAULT_SESSION_TTL_HOURS;
        }

        parse_into(&lookup, "PRESENCE_RETRY_ATTEMPTS", &mut config.presence_retry_attempts);
        parse_into(&lookup, "PRESENCE_RETRY_BASE_MS", &mut config.presence_retry_base_ms);
        parse_into(&lookup, "OUTBOUND_QUEUE", &mut config.outbound_queue);
        parse_into(&lookup, "SUGGESTION_LIMIT", &mut config.suggestion_limit);
        parse_into(&lookup, "MAX_CONNECTIONS", &mut config.max_connections);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.presence_retry_attempts,
            base_delay: Duration::from_millis(self.presence_retry_base_ms),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbound_queue: self.outbound_queue,
            max_connections: self.max_connections,
        }
    }
}

/// Overwrite `slot` with the parsed value of `key`, warning and keeping the
/// default when it does not parse.
fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(value = %raw, "Invalid {key}, using default"),
    }
}
