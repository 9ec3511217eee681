//! Configuration module for netpulse.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Timezone in which `cleanup_hour` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTimezone {
    /// The process's local timezone (`TZ` / system setting).
    Local,
    Utc,
}

impl FromStr for CleanupTimezone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "utc" => Ok(Self::Utc),
            other => Err(format!("unknown timezone {:?} (expected local or utc)", other)),
        }
    }
}

/// A host to register on startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub hostname: String,
    pub display_name: String,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the HTTP API (default: "0.0.0.0")
    pub http_host: String,
    /// HTTP port for the API server (default: 8000)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "./data/pings.db")
    pub db_path: String,
    /// Seconds between probe cycles (default: 60)
    pub ping_interval: u64,
    /// Seconds to wait for each echo reply (default: 5)
    pub ping_timeout: u64,
    /// Additional attempts after a timeout/unreachable (default: 2)
    pub ping_retries: u32,
    /// Upper bound on probes in flight during one cycle (default: 10)
    pub max_concurrent_probes: usize,
    /// Days of history to keep (default: 120)
    pub retention_days: u32,
    /// Hour of day (0-23) at which cleanup runs (default: 2)
    pub cleanup_hour: u32,
    pub cleanup_timezone: CleanupTimezone,
    /// Hosts registered at startup if missing.
    pub monitored_hosts: Vec<HostEntry>,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_host: "0.0.0.0".to_string(),
            http_port: 8000,
            db_path: "./data/pings.db".to_string(),
            ping_interval: 60,
            ping_timeout: 5,
            ping_retries: 2,
            max_concurrent_probes: 10,
            retention_days: 120,
            cleanup_hour: 2,
            cleanup_timezone: CleanupTimezone::Local,
            monitored_hosts: parse_host_list("router.local,8.8.8.8,1.1.1.1"),
            cors_origins: parse_list("http://localhost:3000,http://localhost:5173"),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETPULSE_HOST`, `NETPULSE_PORT`: HTTP bind address
    /// - `NETPULSE_DB_PATH`: Database file path
    /// - `NETPULSE_PING_INTERVAL`, `NETPULSE_PING_TIMEOUT` (seconds), `NETPULSE_PING_RETRIES`
    /// - `NETPULSE_MAX_CONCURRENT_PROBES`
    /// - `NETPULSE_RETENTION_DAYS`, `NETPULSE_CLEANUP_HOUR`, `NETPULSE_CLEANUP_TIMEZONE`
    /// - `NETPULSE_MONITORED_HOSTS`: comma separated `host` or `host=Display Name`
    /// - `NETPULSE_CORS_ORIGINS`: comma separated origins
    ///
    /// Values that fail to parse keep their default.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(host) = lookup("NETPULSE_HOST") {
            cfg.http_host = host;
        }
        override_parsed(&lookup, "NETPULSE_PORT", &mut cfg.http_port);
        if let Some(db_path) = lookup("NETPULSE_DB_PATH") {
            cfg.db_path = db_path;
        }

        override_parsed(&lookup, "NETPULSE_PING_INTERVAL", &mut cfg.ping_interval);
        override_parsed(&lookup, "NETPULSE_PING_TIMEOUT", &mut cfg.ping_timeout);
        override_parsed(&lookup, "NETPULSE_PING_RETRIES", &mut cfg.ping_retries);
        override_parsed(&lookup, "NETPULSE_MAX_CONCURRENT_PROBES", &mut cfg.max_concurrent_probes);
        override_parsed(&lookup, "NETPULSE_RETENTION_DAYS", &mut cfg.retention_days);
        override_parsed(&lookup, "NETPULSE_CLEANUP_HOUR", &mut cfg.cleanup_hour);
        override_parsed(&lookup, "NETPULSE_CLEANUP_TIMEZONE", &mut cfg.cleanup_timezone);

        if let Some(hosts) = lookup("NETPULSE_MONITORED_HOSTS") {
            cfg.monitored_hosts = parse_host_list(&hosts);
        }
        if let Some(origins) = lookup("NETPULSE_CORS_ORIGINS") {
            cfg.cors_origins = parse_list(&origins);
        }

        cfg.sanitize();
        cfg
    }

    /// Reset values that would make the scheduler misbehave.
    fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.ping_interval == 0 {
            tracing::warn!("ping_interval must be positive, using {}s", defaults.ping_interval);
            self.ping_interval = defaults.ping_interval;
        }
        if self.ping_timeout == 0 {
            tracing::warn!("ping_timeout must be positive, using {}s", defaults.ping_timeout);
            self.ping_timeout = defaults.ping_timeout;
        }
        if self.max_concurrent_probes == 0 {
            self.max_concurrent_probes = defaults.max_concurrent_probes;
        }
        if self.cleanup_hour > 23 {
            tracing::warn!("cleanup_hour {} out of range, using {}", self.cleanup_hour, defaults.cleanup_hour);
            self.cleanup_hour = defaults.cleanup_hour;
        }
    }

    pub fn ping_interval_duration(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    pub fn ping_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.ping_timeout)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Ignoring invalid value {:?} for {}", raw, key),
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `host` or `host=Display Name` entries.
pub fn parse_host_list(raw: &str) -> Vec<HostEntry> {
    parse_list(raw)
        .into_iter()
        .filter_map(|entry| {
            let (hostname, display_name) = match entry.split_once('=') {
                Some((h, d)) if !d.trim().is_empty() => (h.trim().to_string(), d.trim().to_string()),
                Some((h, _)) => (h.trim().to_string(), default_display_name(h.trim())),
                None => (entry.clone(), default_display_name(&entry)),
            };
            if hostname.is_empty() {
                return None;
            }
            Some(HostEntry { hostname, display_name })
        })
        .collect()
}

/// Derive a display name from a hostname: `router.local` becomes `Router`.
/// IP literals are kept as-is.
pub fn default_display_name(hostname: &str) -> String {
    if hostname.parse::<std::net::IpAddr>().is_ok() || !hostname.contains('.') {
        return hostname.to_string();
    }
    let label = hostname.split('.').next().unwrap_or(hostname);
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => hostname.to_string(),
    }
}
