//! Host registry: the durable set of monitored targets.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::models::Host;
use super::store::{DbError, Store};
use crate::config::HostEntry;

const HOST_COLUMNS: &str = "id, hostname, display_name, enabled, created_at";

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        id: row.get(0)?,
        hostname: row.get(1)?,
        display_name: row.get(2)?,
        enabled: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl Store {
    /// All hosts ordered by id, optionally only the enabled ones.
    pub fn list_hosts(&self, enabled_only: bool) -> Result<Vec<Host>, DbError> {
        self.with_reader(|conn| {
            let sql = if enabled_only {
                format!("SELECT {HOST_COLUMNS} FROM hosts WHERE enabled = 1 ORDER BY id ASC")
            } else {
                format!("SELECT {HOST_COLUMNS} FROM hosts ORDER BY id ASC")
            };
            let mut stmt = conn.prepare(&sql)?;
            let hosts = stmt
                .query_map([], host_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(hosts)
        })
    }

    pub fn get_host(&self, id: i64) -> Result<Option<Host>, DbError> {
        self.with_reader(|conn| {
            let host = conn
                .query_row(
                    &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1"),
                    params![id],
                    host_from_row,
                )
                .optional()?;
            Ok(host)
        })
    }

    /// Exact, case-sensitive lookup.
    pub fn get_host_by_hostname(&self, hostname: &str) -> Result<Option<Host>, DbError> {
        self.with_reader(|conn| {
            let host = conn
                .query_row(
                    &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE hostname = ?1"),
                    params![hostname],
                    host_from_row,
                )
                .optional()?;
            Ok(host)
        })
    }

    /// Register a new, enabled host.
    ///
    /// Fails with [`DbError::Conflict`] if the hostname is already present.
    pub fn create_host(&self, hostname: &str, display_name: &str) -> Result<Host, DbError> {
        let created_at = Utc::now().timestamp_millis();

        self.with_writer(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM hosts WHERE hostname = ?1)",
                params![hostname],
                |row| row.get(0),
            )?;
            if exists {
                return Err(DbError::Conflict(hostname.to_string()));
            }

            let inserted = conn
                .execute(
                    "INSERT INTO hosts (hostname, display_name, enabled, created_at) VALUES (?1, ?2, 1, ?3)",
                    params![hostname, display_name, created_at],
                )
                .map_err(DbError::from);
            match inserted {
                Ok(_) => {}
                Err(e) if e.is_constraint_violation() => {
                    return Err(DbError::Conflict(hostname.to_string()))
                }
                Err(e) => return Err(e),
            }

            Ok(Host {
                id: conn.last_insert_rowid(),
                hostname: hostname.to_string(),
                display_name: display_name.to_string(),
                enabled: true,
                created_at,
            })
        })
    }

    /// Enable or disable scheduling for a host. History is kept either way.
    pub fn set_host_enabled(&self, id: i64, enabled: bool) -> Result<Host, DbError> {
        self.with_writer(|conn| {
            let changed = conn.execute(
                "UPDATE hosts SET enabled = ?1 WHERE id = ?2",
                params![enabled, id],
            )?;
            if changed == 0 {
                return Err(DbError::NotFound);
            }
            let host = conn.query_row(
                &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1"),
                params![id],
                host_from_row,
            )?;
            Ok(host)
        })
    }

    /// Delete a host together with every result recorded under its hostname.
    ///
    /// Returns the removed host.
    pub fn delete_host(&self, id: i64) -> Result<Host, DbError> {
        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            let host = tx
                .query_row(
                    &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1"),
                    params![id],
                    host_from_row,
                )
                .optional()?
                .ok_or(DbError::NotFound)?;

            let results = tx.execute(
                "DELETE FROM ping_results WHERE host = ?1",
                params![host.hostname],
            )?;
            tx.execute("DELETE FROM hosts WHERE id = ?1", params![id])?;
            tx.commit()?;

            tracing::debug!("Deleted host {} and {} results", host.hostname, results);
            Ok(host)
        })
    }

    /// Register configured hosts that are not known yet. Returns how many
    /// were added.
    pub fn bootstrap_hosts(&self, entries: &[HostEntry]) -> Result<usize, DbError> {
        let mut added = 0;
        for entry in entries {
            match self.create_host(&entry.hostname, &entry.display_name) {
                Ok(host) => {
                    tracing::info!("Added host: {} ({})", host.hostname, host.display_name);
                    added += 1;
                }
                Err(DbError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }
}
