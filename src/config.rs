use crate::error::{PoolError, Result};
use crate::models::ProtocolTag;
use crate::proxy::probe::ProbeTarget;
use crate::proxy::selection::SelectionLimits;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_CHECK_URLS: &str = "http://httpbin.org/ip,\
http://api.ipify.org/?format=json,\
http://ip-api.com/json,\
https://ifconfig.co/json,\
http://api.myip.com/";

const DEFAULT_PARSE_URLS: &str = "https://hidemy.name/en/proxy-list/?anon=4#list,\
https://hidemy.name/en/proxy-list/?anon=4&start=64#list,\
https://hidemy.name/en/proxy-list/?anon=4&start=128#list,\
http://www.proxylists.net/,\
https://www.sslproxies.org/,\
https://free-proxy-list.net/,\
https://us-proxy.org/,\
https://socks-proxy.net/,\
http://pubproxy.com/api/proxy?limit=20&format=txt";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy checking configuration
    pub checker: CheckerConfig,
    /// Proxy discovery configuration
    pub discovery: DiscoveryConfig,
    /// API server configuration
    pub api: ApiServerConfig,
    /// Storage backend selection
    pub store: StoreConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Time between the starts of two check cycles
    pub check_period: Duration,
    /// Global limit of concurrent probes
    pub concurrency: usize,
    /// Protocols to try, in order
    pub protocols: Vec<ProtocolTag>,
    /// Run the WebSocket echo probe on protocols that answered
    pub check_tunnel: bool,
    /// Require the proxy's own IP in the probe response body
    pub require_ip_in_body: bool,
    /// Timeout of one probe request
    pub probe_timeout: Duration,
    /// Timeout of the whole tunnel probe
    pub tunnel_timeout: Duration,
    /// Ping interval while waiting for the echo
    pub tunnel_heartbeat: Duration,
    /// Candidate probe targets
    pub probe_targets: Vec<ProbeTarget>,
    /// WebSocket echo server used by the tunnel probe
    pub tunnel_echo_url: Url,
    /// Per-tier selection caps
    pub selection: SelectionLimits,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Time between the starts of two discovery runs
    pub parse_period: Duration,
    /// Concurrent page fetches
    pub concurrency: usize,
    /// Timeout of one page fetch
    pub fetch_timeout: Duration,
    /// Listing pages to scrape
    pub urls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the API server (default: 8080)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Database name
    pub name: String,
    /// SSL mode (disable, require, prefer)
    pub ssl_mode: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Minimum connections in pool
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            checker: CheckerConfig::from_env()?,
            discovery: DiscoveryConfig {
                parse_period: Duration::from_secs(parse_env("PARSE_PERIOD", 300u64)?),
                concurrency: positive("PARSE_CONCURRENCY", parse_env("PARSE_CONCURRENCY", 20usize)?)?,
                fetch_timeout: Duration::from_secs(parse_env("PARSE_TIMEOUT_SECS", 10u64)?),
                urls: split_list(&get_env_or("PARSE_URLS", DEFAULT_PARSE_URLS)),
            },
            api: ApiServerConfig {
                port: get_env_or("API_PORT", "8080").parse().map_err(|_| {
                    PoolError::InvalidConfig("API_PORT must be a valid port number".into())
                })?,
                host: get_env_or("API_HOST", "0.0.0.0"),
            },
            store: StoreConfig {
                backend: parse_backend(&get_env_or("STORE_BACKEND", "postgres"))?,
            },
            database: DatabaseConfig {
                host: get_env_or("DB_HOST", "localhost"),
                port: get_env_or("DB_PORT", "5432").parse().map_err(|_| {
                    PoolError::InvalidConfig("DB_PORT must be a valid port number".into())
                })?,
                user: get_env_or("DB_USER", "proxylist"),
                password: get_env_or("DB_PASSWORD", "proxylist"),
                name: get_env_or("DB_NAME", "proxylist"),
                ssl_mode: get_env_or("DB_SSLMODE", "disable"),
                max_connections: parse_env("DB_MAX_CONNECTIONS", 20u32)?,
                min_connections: parse_env("DB_MIN_CONNECTIONS", 2u32)?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the database connection URL
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.database.user,
            self.database.password,
            self.database.host,
            self.database.port,
            self.database.name,
            self.database.ssl_mode
        )
    }

    /// Get the API server address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

impl CheckerConfig {
    fn from_env() -> Result<Self> {
        let protocols = ProtocolTag::parse_list(&get_env_or("CHECK_PROTOCOLS", "http"))
            .map_err(|e| PoolError::InvalidConfig(format!("CHECK_PROTOCOLS: {}", e)))?;
        if protocols.is_empty() {
            return Err(PoolError::InvalidConfig(
                "CHECK_PROTOCOLS must name at least one protocol".into(),
            ));
        }

        let probe_targets = split_list(&get_env_or("CHECK_URLS", DEFAULT_CHECK_URLS))
            .iter()
            .map(|raw| ProbeTarget::parse(raw))
            .collect::<Result<Vec<_>>>()?;
        if probe_targets.is_empty() {
            return Err(PoolError::InvalidConfig(
                "CHECK_URLS must contain at least one URL".into(),
            ));
        }

        let tunnel_echo_url = parse_echo_url(&get_env_or(
            "TUNNEL_ECHO_URL",
            "wss://echo.websocket.org/",
        ))?;

        let stale_enabled = parse_bool("CHECK_OLD_ENABLED", false)?;
        let selection = SelectionLimits {
            total_max: parse_env("CHECK_TOTAL_MAX", 1500usize)?,
            active_max: parse_env("CHECK_ACTIVE_MAX", 1000usize)?,
            new_max: parse_env("CHECK_NEW_MAX", 1500usize)?,
            stale_max: if stale_enabled {
                Some(parse_env("CHECK_OLD_MAX", 1000usize)?)
            } else {
                None
            },
            max_negative_streak: parse_env("MAX_NEGATIVE_CHECKS_IN_A_ROW", 60i64)?,
        };

        Ok(CheckerConfig {
            check_period: Duration::from_secs(parse_env("CHECK_PERIOD", 60u64)?),
            concurrency: positive("CHECK_CONCURRENCY", parse_env("CHECK_CONCURRENCY", 100usize)?)?,
            protocols,
            check_tunnel: parse_bool("CHECK_TUNNEL_SUPPORT", false)?,
            require_ip_in_body: parse_bool("CHECK_REQUIRE_IP", false)?,
            probe_timeout: parse_secs("PROBE_TIMEOUT_SECS", 2.0)?,
            tunnel_timeout: parse_secs("TUNNEL_TIMEOUT_SECS", 5.0)?,
            tunnel_heartbeat: parse_secs("TUNNEL_HEARTBEAT_SECS", 1.0)?,
            probe_targets,
            tunnel_echo_url,
            selection,
        })
    }
}

fn parse_backend(raw: &str) -> Result<StoreBackend> {
    match raw.trim().to_lowercase().as_str() {
        "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
        "memory" => Ok(StoreBackend::Memory),
        other => Err(PoolError::InvalidConfig(format!(
            "STORE_BACKEND must be 'postgres' or 'memory', got '{}'",
            other
        ))),
    }
}

fn parse_echo_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| {
        PoolError::InvalidConfig(format!("TUNNEL_ECHO_URL must be a valid URL: {}", e))
    })?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(PoolError::InvalidConfig(format!(
                "TUNNEL_ECHO_URL has unsupported scheme: {}",
                other
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(PoolError::InvalidConfig(
            "TUNNEL_ECHO_URL must include a host".into(),
        ));
    }

    Ok(url)
}

/// Parse an environment variable, falling back to `default` when unset
fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            PoolError::InvalidConfig(format!("{} has an invalid value: '{}'", key, raw))
        }),
        _ => Ok(default),
    }
}

/// Fractional seconds; must be finite and above zero
fn parse_secs(key: &str, default: f64) -> Result<Duration> {
    let secs: f64 = parse_env(key, default)?;
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(PoolError::InvalidConfig(format!(
            "{} must be a positive number of seconds, got '{}'",
            key, secs
        ))),
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(PoolError::InvalidConfig(format!(
                "{} must be a boolean, got '{}'",
                key, raw
            ))),
        },
        Err(_) => Ok(default),
    }
}

fn positive(key: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(PoolError::InvalidConfig(format!("{} must be at least 1", key)));
    }
    Ok(value)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
