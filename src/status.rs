//! Per-host status derived from the stored time series on every request.

use chrono::Utc;

use crate::db::{DbError, HostStatus, Store};

/// Length of the rolling window behind `last_24h_avg` and `uptime_24h`.
pub const STATUS_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// Status of every enabled host, in registry order.
pub fn current_status(store: &Store) -> Result<Vec<HostStatus>, DbError> {
    current_status_at(store, Utc::now().timestamp_millis())
}

/// [`current_status`] evaluated as of `now_ms`.
///
/// A host without history keeps its identity and reports `None` for every
/// measurement.
pub fn current_status_at(store: &Store, now_ms: i64) -> Result<Vec<HostStatus>, DbError> {
    let since = now_ms - STATUS_WINDOW_MS;

    store
        .list_hosts(true)?
        .into_iter()
        .map(|host| {
            let latest = store.latest_result(&host.hostname, now_ms)?;
            let window = store.window_summary(&host.hostname, since, now_ms)?;

            Ok(HostStatus {
                last_ping: latest.as_ref().map(|r| r.timestamp),
                latency: latest.as_ref().and_then(|r| r.latency),
                success: latest.as_ref().map(|r| r.success),
                last_24h_avg: window.avg_latency,
                uptime_24h: window.uptime(),
                id: host.id,
                hostname: host.hostname,
                display_name: host.display_name,
                enabled: host.enabled,
            })
        })
        .collect()
}
