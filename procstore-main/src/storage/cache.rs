//! Aggregate cache backed by an in-memory DuckDB table.
//!
//! Entries carry an optional absolute expiry in epoch millis. Expired rows
//! are invisible to reads immediately and are physically removed by a
//! rate-limited sweep, so a busy cache does not pay a DELETE on every call.

use crate::clock::Clock;
use crate::error::CacheError;
use crate::storage::{CacheStore, Expiry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{params, Connection, OptionalExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Rate limiter for expired-entry sweeps, shared by every handle of one cache.
#[derive(Clone)]
pub struct CacheManager {
    last_sweep: Arc<RwLock<Option<DateTime<Utc>>>>,
    min_sweep_interval: Duration,
}

impl CacheManager {
    pub fn new(min_sweep_interval: Duration) -> Self {
        Self {
            last_sweep: Arc::new(RwLock::new(None)),
            min_sweep_interval,
        }
    }

    /// Returns the cutoff to sweep with when enough time has passed since
    /// the previous sweep, and records `now` as the new sweep time.
    pub async fn should_sweep(&self, now: DateTime<Utc>) -> Option<i64> {
        let interval = chrono::Duration::from_std(self.min_sweep_interval).unwrap_or(chrono::Duration::zero());
        {
            let last = self.last_sweep.read().await;
            if let Some(last) = *last {
                if now - last < interval {
                    return None;
                }
            }
        }

        let mut last = self.last_sweep.write().await;
        // another caller may have swept between the two locks
        if let Some(prev) = *last {
            if now - prev < interval {
                return None;
            }
        }
        *last = Some(now);
        Some(now.timestamp_millis())
    }

    pub fn sweep_query(&self, cutoff: i64) -> String {
        format!(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= {}",
            cutoff
        )
    }
}

/// DuckDB-backed [`CacheStore`].
#[derive(Clone)]
pub struct DuckDbCache {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    manager: CacheManager,
}

impl DuckDbCache {
    /// Opens a private in-memory cache.
    pub fn new_in_memory(clock: Arc<dyn Clock>, sweep_interval: Duration) -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                cache_key VARCHAR PRIMARY KEY,
                value DOUBLE NOT NULL,
                expires_at BIGINT
            );
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            manager: CacheManager::new(sweep_interval),
        })
    }

    /// Locks the connection, sweeping expired rows first when due.
    async fn connection(&self) -> (tokio::sync::MutexGuard<'_, Connection>, i64) {
        let now = self.clock.now();
        let conn = self.conn.lock().await;
        if let Some(cutoff) = self.manager.should_sweep(now).await {
            match conn.execute(&self.manager.sweep_query(cutoff), params![]) {
                Ok(removed) if removed > 0 => debug!(removed, "swept expired cache entries"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "cache sweep failed"),
            }
        }
        (conn, now.timestamp_millis())
    }

    /// Number of live entries.
    pub async fn len(&self) -> Result<usize, CacheError> {
        let (conn, now) = self.connection().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE expires_at IS NULL OR expires_at > ?",
            params![now],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    pub async fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len().await? == 0)
    }

    /// Removes every entry.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM cache_entries", params![])?;
        Ok(())
    }
}

fn expires_at(expiry: Expiry) -> Option<i64> {
    match expiry {
        Expiry::At(at) => Some(at.timestamp_millis()),
        Expiry::Never | Expiry::Keep => None,
    }
}

#[async_trait]
impl CacheStore for DuckDbCache {
    async fn get(&self, key: &str) -> Result<Option<f64>, CacheError> {
        let (conn, now) = self.connection().await;
        let value = conn
            .query_row(
                "SELECT value FROM cache_entries WHERE cache_key = ? AND (expires_at IS NULL OR expires_at > ?)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: f64, expiry: Expiry) -> Result<bool, CacheError> {
        let (conn, now) = self.connection().await;

        if expiry == Expiry::Keep {
            let updated = conn.execute(
                "UPDATE cache_entries SET value = ? \
                 WHERE cache_key = ? AND (expires_at IS NULL OR expires_at > ?)",
                params![value, key, now],
            )?;
            return Ok(updated > 0);
        }

        conn.execute(
            "INSERT INTO cache_entries (cache_key, value, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT (cache_key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
            params![key, value, expires_at(expiry)],
        )?;
        Ok(true)
    }

    async fn increment_by(&self, key: &str, delta: f64, expiry: Expiry) -> Result<f64, CacheError> {
        let (conn, now) = self.connection().await;

        // An expired row counts as missing: its value and expiry are replaced.
        conn.execute(
            &format!(
                "INSERT INTO cache_entries (cache_key, value, expires_at) VALUES (?, ?, ?) \
                 ON CONFLICT (cache_key) DO UPDATE SET \
                 value = CASE WHEN cache_entries.expires_at IS NOT NULL AND cache_entries.expires_at <= {now} \
                     THEN EXCLUDED.value ELSE cache_entries.value + EXCLUDED.value END, \
                 expires_at = CASE WHEN cache_entries.expires_at IS NOT NULL AND cache_entries.expires_at <= {now} \
                     THEN EXCLUDED.expires_at ELSE cache_entries.expires_at END"
            ),
            params![key, delta, expires_at(expiry)],
        )?;

        let value: f64 = conn.query_row(
            "SELECT value FROM cache_entries WHERE cache_key = ?",
            params![key],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let (conn, _) = self.connection().await;
        conn.execute("DELETE FROM cache_entries WHERE cache_key = ?", params![key])?;
        Ok(())
    }
}
