use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Sentinel `DATABASE_URL` selecting the in-process store.
pub const MEMORY_DATABASE: &str = "memory";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    /// SQLite URL, or `memory`
    pub database_url: String,
    pub cors_origins: Vec<String>,
    pub cleanup_interval: Duration,
    /// Participants and rooms idle longer than this are swept
    pub inactivity_timeout: Duration,
    /// Per-connection outbound queue; a full queue drops the connection
    pub outbound_queue_capacity: usize,
    /// Per-room backfill bound, 0 for unbounded
    pub message_log_capacity: usize,
    pub max_frame_bytes: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|var| dotenv::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str, default: &str| {
            lookup(var)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_owned())
        };

        let host = get("HOST", "0.0.0.0")
            .parse()
            .map_err(|_| ConfigError::Invalid("HOST", "expected an IP address".into()))?;
        let port = parse(&get, "PORT", "8080")?;

        let cors_origins = get("CORS_ORIGINS", "http://localhost:5173,http://localhost:3000")
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_owned)
            .collect();

        Ok(Self {
            host,
            port,
            database_url: get("DATABASE_URL", "sqlite://hushrooms.db?mode=rwc"),
            cors_origins,
            cleanup_interval: secs(&get, "CLEANUP_INTERVAL_SECS", "60")?,
            inactivity_timeout: secs(&get, "INACTIVITY_TIMEOUT_SECS", "300")?,
            outbound_queue_capacity: nonzero(&get, "OUTBOUND_QUEUE_CAPACITY", "256")?,
            message_log_capacity: parse(&get, "MESSAGE_LOG_CAPACITY", "500")?,
            max_frame_bytes: nonzero(&get, "MAX_FRAME_BYTES", "65536")?,
            ping_interval: secs(&get, "PING_INTERVAL_SECS", "54")?,
            pong_timeout: secs(&get, "PONG_TIMEOUT_SECS", "60")?,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url.eq_ignore_ascii_case(MEMORY_DATABASE)
    }

    pub fn socket(&self) -> SocketConfig {
        SocketConfig {
            max_frame_bytes: self.max_frame_bytes,
            ping_interval: self.ping_interval,
            pong_timeout: self.pong_timeout,
        }
    }
}

/// The slice of [`Config`] WebSocket handlers need.
#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    pub max_frame_bytes: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 64 * 1024,
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

fn parse<T: std::str::FromStr>(
    get: &impl Fn(&'static str, &str) -> String,
    var: &'static str,
    default: &str,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let raw = get(var, default);
    raw.parse()
        .map_err(|e: T::Err| ConfigError::Invalid(var, format!("{raw:?}: {e}")))
}

fn nonzero(
    get: &impl Fn(&'static str, &str) -> String,
    var: &'static str,
    default: &str,
) -> Result<usize, ConfigError> {
    match parse(get, var, default)? {
        0 => Err(ConfigError::Invalid(var, "must be greater than zero".into())),
        n => Ok(n),
    }
}

fn secs(
    get: &impl Fn(&'static str, &str) -> String,
    var: &'static str,
    default: &str,
) -> Result<Duration, ConfigError> {
    match parse(get, var, default)? {
        0 => Err(ConfigError::Invalid(var, "must be greater than zero".into())),
        n => Ok(Duration::from_secs(n)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid environment variable {0}: {1}")]
    Invalid(&'static str, String),
}
