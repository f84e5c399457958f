//! Engine configuration and endpoint resolution.

use std::time::Duration;

/// Environment variable naming the real-time endpoint, read both at run time
/// and at build time.
pub const ENDPOINT_ENV: &str = "PARLEY_SOCKET_URL";

/// Used when nothing else is configured.
pub const FALLBACK_ENDPOINT: &str = "ws://localhost:3001";

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// WebSocket endpoint
    pub endpoint: String,
    /// Backoff delay for the first reconnect attempt
    pub base_delay: Duration,
    /// Upper bound for any reconnect delay
    pub max_delay: Duration,
    /// Fraction of the backoff delay added as random jitter
    pub jitter_factor: f64,
    /// Reconnect attempts allowed in one `rate_window`
    pub max_attempts_per_window: usize,
    pub rate_window: Duration,
    /// Liveness probe interval while connected
    pub heartbeat_interval: Duration,
    /// Time without a pong before the channel is considered stale
    pub stale_timeout: Duration,
    /// Upper bound for one channel-open attempt
    pub connect_timeout: Duration,
    /// Lifetime of a typing indicator without refresh
    pub typing_ttl: Duration,
    /// How recent `lastSeen` must be for an online user to count as active
    pub presence_freshness: Duration,
    /// Maximum operations held in the offline queue
    pub queue_capacity: usize,
    /// Command channel capacity of the engine handle
    pub command_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: resolve_endpoint(None),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.3,
            max_attempts_per_window: 10,
            rate_window: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(25),
            stale_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            typing_ttl: Duration::from_secs(5),
            presence_freshness: Duration::from_secs(5 * 60),
            queue_capacity: 10_000,
            command_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Default configuration pointed at `endpoint`.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}

/// Resolve the endpoint URL.
///
/// Priority: explicit override, `PARLEY_SOCKET_URL` at run time,
/// `PARLEY_SOCKET_URL` at build time, then [`FALLBACK_ENDPOINT`].
pub fn resolve_endpoint(override_url: Option<&str>) -> String {
    let runtime = std::env::var(ENDPOINT_ENV).ok();
    pick_endpoint(override_url, runtime.as_deref(), option_env!("PARLEY_SOCKET_URL"))
}

fn pick_endpoint(override_url: Option<&str>, runtime: Option<&str>, build_time: Option<&str>) -> String {
    [override_url, runtime, build_time]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|url| !url.is_empty())
        .unwrap_or(FALLBACK_ENDPOINT)
        .to_string()
}
