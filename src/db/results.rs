//! Append-only time series of probe results.
//!
//! All range queries are inclusive on both ends: a row at exactly
//! `start_ms` or `end_ms` is part of the range.

use rusqlite::{params, OptionalExtension, Row};

use super::models::{round2, ProbeResult, RangeStats, WindowSummary};
use super::store::{DbError, Store};

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<ProbeResult> {
    Ok(ProbeResult {
        host: row.get(0)?,
        timestamp: row.get(1)?,
        latency: row.get(2)?,
        success: row.get(3)?,
        error: row.get(4)?,
    })
}

impl Store {
    /// Append one result. Only results whose latency and success flag
    /// disagree are rejected.
    pub fn insert_result(&self, result: &ProbeResult) -> Result<(), DbError> {
        if !result.is_consistent() {
            return Err(DbError::InvalidResult(format!(
                "success={} latency={:?} for {}",
                result.success, result.latency, result.host
            )));
        }

        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO ping_results (host, timestamp, latency, success, error) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    result.host,
                    result.timestamp,
                    result.latency,
                    result.success,
                    result.error,
                ],
            )?;
            Ok(())
        })
    }

    /// Results for `hostname` with `start_ms <= timestamp <= end_ms`, ascending.
    ///
    /// When more than `limit` rows match, the most recent `limit` are kept.
    pub fn query_results(
        &self,
        hostname: &str,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<ProbeResult>, DbError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT host, timestamp, latency, success, error FROM (
                     SELECT id, host, timestamp, latency, success, error FROM ping_results
                     WHERE host = ?1 AND timestamp BETWEEN ?2 AND ?3
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?4
                 ) ORDER BY timestamp ASC, id ASC",
            )?;
            let results = stmt
                .query_map(params![hostname, start_ms, end_ms, limit], result_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(results)
        })
    }

    /// The most recent result for `hostname` stamped at or before `until_ms`.
    pub fn latest_result(
        &self,
        hostname: &str,
        until_ms: i64,
    ) -> Result<Option<ProbeResult>, DbError> {
        self.with_reader(|conn| {
            let result = conn
                .query_row(
                    "SELECT host, timestamp, latency, success, error FROM ping_results
                     WHERE host = ?1 AND timestamp <= ?2 ORDER BY timestamp DESC, id DESC LIMIT 1",
                    params![hostname, until_ms],
                    result_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    /// Latency and success statistics over an inclusive range.
    ///
    /// An empty range reports a success rate of 0 rather than `None`.
    pub fn range_stats(
        &self,
        hostname: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<RangeStats, DbError> {
        self.with_reader(|conn| {
            let stats = conn.query_row(
                "SELECT AVG(latency), MIN(latency), MAX(latency), COUNT(*), COALESCE(SUM(success), 0)
                 FROM ping_results WHERE host = ?1 AND timestamp BETWEEN ?2 AND ?3",
                params![hostname, start_ms, end_ms],
                |row| {
                    let avg: Option<f64> = row.get(0)?;
                    let min: Option<f64> = row.get(1)?;
                    let max: Option<f64> = row.get(2)?;
                    let total: i64 = row.get(3)?;
                    let successful: i64 = row.get(4)?;
                    let success_rate = if total > 0 {
                        round2(successful as f64 / total as f64 * 100.0)
                    } else {
                        0.0
                    };
                    Ok(RangeStats {
                        avg_latency: avg.map(round2),
                        min_latency: min.map(round2),
                        max_latency: max.map(round2),
                        success_rate,
                        total,
                        successful,
                    })
                },
            )?;
            Ok(stats)
        })
    }

    /// Counts and average latency for results with
    /// `since_ms <= timestamp <= until_ms`.
    pub fn window_summary(
        &self,
        hostname: &str,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<WindowSummary, DbError> {
        self.with_reader(|conn| {
            let summary = conn.query_row(
                "SELECT AVG(latency), COUNT(*), COALESCE(SUM(success), 0)
                 FROM ping_results WHERE host = ?1 AND timestamp BETWEEN ?2 AND ?3",
                params![hostname, since_ms, until_ms],
                |row| {
                    Ok(WindowSummary {
                        avg_latency: row.get::<_, Option<f64>>(0)?.map(round2),
                        total: row.get(1)?,
                        successful: row.get(2)?,
                    })
                },
            )?;
            Ok(summary)
        })
    }

    /// Delete every result with a timestamp strictly before `cutoff_ms`.
    /// Returns the number of rows removed.
    pub fn delete_older_than(&self, cutoff_ms: i64) -> Result<usize, DbError> {
        self.with_writer(|conn| {
            let deleted = conn.execute(
                "DELETE FROM ping_results WHERE timestamp < ?1",
                params![cutoff_ms],
            )?;
            Ok(deleted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_store;

    const H: &str = "8.8.8.8";

    #[test]
    fn test_query_returns_all_rows_ascending() {
        let (_dir, store) = temp_store();
        // Insert out of order; the store sorts on read.
        for ts in [1_000, 5_000, 3_000, 2_000, 4_000] {
            store.insert_result(&ProbeResult::succeeded(H, ts, ts as f64 / 100.0)).unwrap();
        }

        let rows = store.query_results(H, 1_000, 5_000, 10).unwrap();
        let timestamps: Vec<i64> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![1_000, 2_000, 3_000, 4_000, 5_000]);
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let (_dir, store) = temp_store();
        for ts in [999, 1_000, 1_500, 2_000, 2_001] {
            store.insert_result(&ProbeResult::failed(H, ts, "timeout")).unwrap();
        }
        let rows = store.query_results(H, 1_000, 2_000, 100).unwrap();
        let timestamps: Vec<i64> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![1_000, 1_500, 2_000]);

        let stats = store.range_stats(H, 1_000, 2_000).unwrap();
        assert_eq!(stats.total, 3);
    }

    #[test]
    fn test_truncation_keeps_most_recent() {
        let (_dir, store) = temp_store();
        for ts in 0..150 {
            store.insert_result(&ProbeResult::succeeded(H, ts, 1.0)).unwrap();
        }
        let rows = store.query_results(H, 0, 149, 100).unwrap();
        assert_eq!(rows.len(), 100);
        assert_eq!(rows.first().unwrap().timestamp, 50);
        assert_eq!(rows.last().unwrap().timestamp, 149);
        assert!(rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_query_filters_by_host() {
        let (_dir, store) = temp_store();
        store.insert_result(&ProbeResult::succeeded(H, 10, 1.0)).unwrap();
        store.insert_result(&ProbeResult::succeeded("1.1.1.1", 10, 1.0)).unwrap();
        assert_eq!(store.query_results(H, 0, 100, 10).unwrap().len(), 1);
        assert!(store.query_results("9.9.9.9", 0, 100, 10).unwrap().is_empty());
    }

    #[test]
    fn test_latency_invariant_on_stored_rows() {
        let (_dir, store) = temp_store();
        store.insert_result(&ProbeResult::succeeded(H, 1, 4.2)).unwrap();
        store.insert_result(&ProbeResult::failed(H, 2, "unreachable")).unwrap();

        for row in store.query_results(H, 0, 10, 10).unwrap() {
            assert_eq!(row.latency.is_some(), row.success);
        }

        let mut bad = ProbeResult::failed(H, 3, "timeout");
        bad.latency = Some(1.0);
        assert!(matches!(store.insert_result(&bad), Err(DbError::InvalidResult(_))));
    }

    #[test]
    fn test_stats_mixed_rows() {
        let (_dir, store) = temp_store();
        store.insert_result(&ProbeResult::succeeded(H, 1, 10.0)).unwrap();
        store.insert_result(&ProbeResult::succeeded(H, 2, 20.0)).unwrap();
        store.insert_result(&ProbeResult::succeeded(H, 3, 31.0)).unwrap();
        store.insert_result(&ProbeResult::failed(H, 4, "timeout")).unwrap();

        let stats = store.range_stats(H, 0, 10).unwrap();
        assert_eq!(stats.avg_latency, Some(20.33));
        assert_eq!(stats.min_latency, Some(10.0));
        assert_eq!(stats.max_latency, Some(31.0));
        assert_eq!(stats.success_rate, 75.0);
    }

    #[test]
    fn test_stats_only_failures() {
        let (_dir, store) = temp_store();
        store.insert_result(&ProbeResult::failed(H, 1, "timeout")).unwrap();
        store.insert_result(&ProbeResult::failed(H, 2, "unreachable")).unwrap();

        let stats = store.range_stats(H, 0, 10).unwrap();
        assert_eq!(stats.avg_latency, None);
        assert_eq!(stats.min_latency, None);
        assert_eq!(stats.max_latency, None);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.total, 2);
    }

    #[test]
    fn test_stats_empty_range() {
        let (_dir, store) = temp_store();
        let stats = store.range_stats(H, 0, 10).unwrap();
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.avg_latency, None);
    }

    #[test]
    fn test_latest_result() {
        let (_dir, store) = temp_store();
        assert!(store.latest_result(H, i64::MAX).unwrap().is_none());
        store.insert_result(&ProbeResult::succeeded(H, 20, 2.0)).unwrap();
        store.insert_result(&ProbeResult::failed(H, 30, "timeout")).unwrap();
        store.insert_result(&ProbeResult::succeeded(H, 10, 1.0)).unwrap();

        let latest = store.latest_result(H, i64::MAX).unwrap().unwrap();
        assert_eq!(latest.timestamp, 30);
        assert!(!latest.success);

        let earlier = store.latest_result(H, 25).unwrap().unwrap();
        assert_eq!(earlier.timestamp, 20);
    }

    #[test]
    fn test_delete_older_than_is_idempotent() {
        let (_dir, store) = temp_store();
        for ts in [100, 200, 300, 400] {
            store.insert_result(&ProbeResult::succeeded(H, ts, 1.0)).unwrap();
        }

        assert_eq!(store.delete_older_than(300).unwrap(), 2);
        assert_eq!(store.delete_older_than(300).unwrap(), 0);

        let remaining: Vec<i64> = store
            .query_results(H, 0, 1_000, 10)
            .unwrap()
            .iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(remaining, vec![300, 400]);
    }

    #[test]
    fn test_window_summary() {
        let (_dir, store) = temp_store();
        store.insert_result(&ProbeResult::succeeded(H, 50, 99.0)).unwrap();
        store.insert_result(&ProbeResult::succeeded(H, 100, 4.0)).unwrap();
        store.insert_result(&ProbeResult::failed(H, 150, "timeout")).unwrap();
        // Stamped after the window end: excluded.
        store.insert_result(&ProbeResult::succeeded(H, 151, 80.0)).unwrap();

        let summary = store.window_summary(H, 100, 150).unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.avg_latency, Some(4.0));
        assert_eq!(summary.uptime(), Some(50.0));
    }

    #[test]
    fn test_concurrent_inserts_and_reads() {
        let (_dir, store) = temp_store();
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let ts = w * 1_000 + i;
                        store.insert_result(&ProbeResult::succeeded(H, ts, 1.0)).unwrap();
                    }
                })
            })
            .collect();
        let reader = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    for row in store.query_results(H, 0, 10_000, 1_000).unwrap() {
                        assert!(row.success && row.latency == Some(1.0));
                    }
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(store.query_results(H, 0, 10_000, 1_000).unwrap().len(), 200);
    }
}
