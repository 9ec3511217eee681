//! Database model types.

use serde::{Deserialize, Serialize};

/// A monitored target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: i64,
    pub hostname: String,
    pub display_name: String,
    pub enabled: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// A single probe outcome. Rows are never updated once written.
///
/// `latency` is `Some` exactly when `success` is true; use the
/// constructors to keep that invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub host: String,
    /// Probe-issue time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Round-trip time in milliseconds.
    pub latency: Option<f64>,
    pub success: bool,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn succeeded(host: impl Into<String>, timestamp: i64, latency_ms: f64) -> Self {
        Self {
            host: host.into(),
            timestamp,
            latency: Some(latency_ms),
            success: true,
            error: None,
        }
    }

    pub fn failed(host: impl Into<String>, timestamp: i64, error: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            timestamp,
            latency: None,
            success: false,
            error: Some(error.into()),
        }
    }

    /// True when `latency` and `success` agree.
    pub fn is_consistent(&self) -> bool {
        self.latency.is_some() == self.success && self.latency.map_or(true, f64::is_finite)
    }
}

/// Aggregates over a closed time range.
///
/// Latency figures only consider successful rows and are `None` when there
/// are none. `success_rate` is 0 for an empty range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeStats {
    pub avg_latency: Option<f64>,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub success_rate: f64,
    pub total: i64,
    pub successful: i64,
}

/// Raw counts over a trailing window, used for rolling uptime.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowSummary {
    pub avg_latency: Option<f64>,
    pub total: i64,
    pub successful: i64,
}

impl WindowSummary {
    /// Percentage of successful probes, `None` when the window is empty.
    pub fn uptime(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(round2(self.successful as f64 / self.total as f64 * 100.0))
    }
}

/// Point-in-time view of one host, derived on every request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostStatus {
    pub id: i64,
    pub hostname: String,
    pub display_name: String,
    pub enabled: bool,
    /// Timestamp of the most recent probe.
    pub last_ping: Option<i64>,
    pub latency: Option<f64>,
    pub success: Option<bool>,
    pub last_24h_avg: Option<f64>,
    /// Percentage, `None` without probes in the window.
    pub uptime_24h: Option<f64>,
}

/// Database file statistics for the cleanup status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub db_size_bytes: i64,
    pub page_count: i64,
    pub page_size: i64,
    pub freelist_count: i64,
    pub result_count: i64,
    pub host_count: i64,
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
