// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Connection-level limits are grouped into
// `ConnectionSettings` and handed to the WebSocket layer as one value.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use crate::{
    rate_limit::{RateLimitConfig, DEFAULT_BURST, DEFAULT_REFILL_INTERVAL},
    rooms::dispatcher::DEFAULT_SEND_TIMEOUT,
};

const DEFAULT_PORT: u16 = 4000;
const DEFAULT_FRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60 * 60);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_OUTBOUND_BUFFER: usize = 64;
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_THREAD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Largest inbound WebSocket frame accepted. Control frames are tiny.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Ceiling for every timer setting; deadlines are computed as `now + value`.
pub const MAX_TIMER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Limits applied to every accepted WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub rate_limit: RateLimitConfig,
    /// Upper bound on a single wait for the next inbound frame.
    pub frame_wait_timeout: Duration,
    /// Upper bound on one socket write. A peer that stops reading is
    /// dropped once a write stalls this long.
    pub write_timeout: Duration,
    /// Capacity of the per-connection outbound queue.
    pub outbound_buffer: usize,
    pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            frame_wait_timeout: DEFAULT_FRAME_WAIT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `globechat_relay=debug`).
    pub log_filter: String,
    pub connection: ConnectionSettings,
    /// How long a notification may wait on one member's full queue.
    pub send_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Threads older than this are removed by the expiry sweep.
    pub thread_ttl: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `GLOBECHAT_RELAY_HOST` | `0.0.0.0` |
    /// | `GLOBECHAT_RELAY_PORT` | `4000` |
    /// | `GLOBECHAT_RELAY_LOG_FILTER` | `info` |
    /// | `GLOBECHAT_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `GLOBECHAT_RELAY_RATE_LIMIT_REFILL_MS` | `100` |
    /// | `GLOBECHAT_RELAY_RATE_LIMIT_BURST` | `10` |
    /// | `GLOBECHAT_RELAY_FRAME_WAIT_TIMEOUT_SECS` | `18000` |
    /// | `GLOBECHAT_RELAY_WRITE_TIMEOUT_MS` | `5000` |
    /// | `GLOBECHAT_RELAY_SEND_TIMEOUT_MS` | `5000` |
    /// | `GLOBECHAT_RELAY_OUTBOUND_BUFFER` | `64` |
    /// | `GLOBECHAT_RELAY_CLEANUP_INTERVAL_SECS` | `86400` |
    /// | `GLOBECHAT_RELAY_THREAD_TTL_SECS` | `86400` |
    ///
    /// Unparseable or zero values fall back to the default. Timer values
    /// above [`MAX_TIMER`] are capped to it.
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("GLOBECHAT_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = positive(&env, "GLOBECHAT_RELAY_PORT").unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let cors_origins = env("GLOBECHAT_RELAY_CORS_ORIGINS").ok();
        let log_filter = env("GLOBECHAT_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let rate_limit = RateLimitConfig {
            refill_interval: timer(
                &env,
                "GLOBECHAT_RELAY_RATE_LIMIT_REFILL_MS",
                Duration::from_millis,
            )
            .unwrap_or(DEFAULT_REFILL_INTERVAL),
            burst: positive(&env, "GLOBECHAT_RELAY_RATE_LIMIT_BURST").unwrap_or(DEFAULT_BURST),
        };
        let connection = ConnectionSettings {
            rate_limit,
            frame_wait_timeout: timer(
                &env,
                "GLOBECHAT_RELAY_FRAME_WAIT_TIMEOUT_SECS",
                Duration::from_secs,
            )
            .unwrap_or(DEFAULT_FRAME_WAIT_TIMEOUT),
            write_timeout: timer(&env, "GLOBECHAT_RELAY_WRITE_TIMEOUT_MS", Duration::from_millis)
                .unwrap_or(DEFAULT_WRITE_TIMEOUT),
            outbound_buffer: positive(&env, "GLOBECHAT_RELAY_OUTBOUND_BUFFER")
                .unwrap_or(DEFAULT_OUTBOUND_BUFFER),
            max_frame_bytes: MAX_FRAME_BYTES,
        };

        let send_timeout = timer(&env, "GLOBECHAT_RELAY_SEND_TIMEOUT_MS", Duration::from_millis)
            .unwrap_or(DEFAULT_SEND_TIMEOUT);
        let cleanup_interval =
            timer(&env, "GLOBECHAT_RELAY_CLEANUP_INTERVAL_SECS", Duration::from_secs)
                .unwrap_or(DEFAULT_CLEANUP_INTERVAL);
        let thread_ttl = positive(&env, "GLOBECHAT_RELAY_THREAD_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_THREAD_TTL);

        Self {
            listen_addr,
            cors_origins,
            log_filter,
            connection,
            send_timeout,
            cleanup_interval,
            thread_ttl,
        }
    }
}

fn positive<F, T>(env: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: FromStr + Default + PartialEq,
{
    env(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value != T::default())
}

fn timer<F>(env: &F, key: &str, unit: fn(u64) -> Duration) -> Option<Duration>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    positive::<F, u64>(env, key).map(|value| unit(value).min(MAX_TIMER))
}
