// Relay server configuration.
//
// All settings come from `DECKSYNC_RELAY_*` environment variables with
// defaults suited to local development.

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SNAPSHOT_EVERY_UPDATES: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `decksync_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    pub room: RoomConfig,
}

/// Settings handed to every room and socket.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Frames larger than this close the socket with 1009.
    pub max_frame_bytes: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Persist a snapshot after this many accepted updates (0 disables).
    pub snapshot_every_updates: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            snapshot_every_updates: DEFAULT_SNAPSHOT_EVERY_UPDATES,
        }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `DECKSYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `DECKSYNC_RELAY_PORT` | `8080` |
    /// | `DECKSYNC_RELAY_LOG_FILTER` | `info` |
    /// | `DECKSYNC_RELAY_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `DECKSYNC_RELAY_MAX_FRAME_BYTES` | `262144` |
    /// | `DECKSYNC_RELAY_HEARTBEAT_INTERVAL_MS` | `15000` |
    /// | `DECKSYNC_RELAY_HEARTBEAT_TIMEOUT_MS` | `10000` |
    /// | `DECKSYNC_RELAY_SNAPSHOT_EVERY_UPDATES` | `200` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("DECKSYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "DECKSYNC_RELAY_PORT", 8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let log_filter = env("DECKSYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("DECKSYNC_RELAY_LOG_FORMAT").as_deref() {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let defaults = RoomConfig::default();
        let room = RoomConfig {
            max_frame_bytes: parse_or(
                &env,
                "DECKSYNC_RELAY_MAX_FRAME_BYTES",
                defaults.max_frame_bytes,
            ),
            heartbeat_interval: Duration::from_millis(parse_or(
                &env,
                "DECKSYNC_RELAY_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval.as_millis() as u64,
            )),
            heartbeat_timeout: Duration::from_millis(parse_or(
                &env,
                "DECKSYNC_RELAY_HEARTBEAT_TIMEOUT_MS",
                defaults.heartbeat_timeout.as_millis() as u64,
            )),
            snapshot_every_updates: parse_or(
                &env,
                "DECKSYNC_RELAY_SNAPSHOT_EVERY_UPDATES",
                defaults.snapshot_every_updates,
            ),
        };

        Self { listen_addr, log_filter, log_format, room }
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}
