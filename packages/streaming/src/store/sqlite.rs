// ABOUTME: SQLite-backed StreamStore persisting logs, cursors, and expiring keys
// ABOUTME: Pub/sub and append wakeups go through an in-process signal hub

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    now_millis, wait_for_entries, Cursor, LogEntry, SignalHub, StreamStore, Subscription,
    Versioned,
};
use crate::error::Result;

/// How often a blocked reader re-checks for rows written by other processes
const CROSS_PROCESS_RECHECK: Duration = Duration::from_millis(250);

fn ttl_deadline(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2);
    (now_millis() as i64).saturating_add(ttl_ms)
}

fn row_to_entry(row: &SqliteRow) -> Result<LogEntry> {
    let millis: i64 = row.try_get("millis")?;
    let seq: i64 = row.try_get("seq")?;
    Ok(LogEntry {
        id: Cursor {
            millis: millis as u64,
            seq: seq as u64,
        }
        .to_string(),
        kind: row.try_get("kind")?,
        payload: row.try_get("payload")?,
    })
}

pub struct SqliteStreamStore {
    pool: SqlitePool,
    hub: Arc<SignalHub>,
    /// Serializes read-modify-write sequences issued from this process
    write_lock: Mutex<()>,
}

impl SqliteStreamStore {
    /// Wrap a pool whose schema has already been migrated
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            hub: Arc::new(SignalHub::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn live_versioned(&self, key: &str) -> Result<Versioned> {
        let row = sqlx::query(
            r#"
            SELECT value, version FROM stream_keys
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(now_millis() as i64)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let version: i64 = row.try_get("version")?;
                Ok(Versioned {
                    value: Some(row.try_get("value")?),
                    version: version as u64,
                })
            }
            None => Ok(Versioned::default()),
        }
    }

    /// Version for a new write: strictly newer than `current`, and time-based so a
    /// recreated key never reuses a version a concurrent reader may still hold
    fn fresh_version(current: u64) -> i64 {
        let micros = u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0);
        micros.max(current + 1) as i64
    }

    async fn write_key(&self, key: &str, value: &str, version: i64, ttl: Duration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stream_keys (key, value, version, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = excluded.version,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(version)
        .bind(ttl_deadline(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StreamStore for SqliteStreamStore {
    async fn append(
        &self,
        log: &str,
        kind: &str,
        payload: Option<&str>,
        max_len: usize,
    ) -> Result<String> {
        let cursor = {
            let _guard = self.write_lock.lock().await;
            let mut tx = self.pool.begin().await?;

            let last = sqlx::query("SELECT millis, seq FROM stream_cursors WHERE log = ?")
                .bind(log)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| -> Result<Cursor> {
                    let millis: i64 = row.try_get("millis")?;
                    let seq: i64 = row.try_get("seq")?;
                    Ok(Cursor {
                        millis: millis as u64,
                        seq: seq as u64,
                    })
                })
                .transpose()?
                .unwrap_or_default();
            let cursor = last.next(now_millis());

            sqlx::query(
                r#"
                INSERT INTO stream_cursors (log, millis, seq) VALUES (?, ?, ?)
                ON CONFLICT(log) DO UPDATE SET millis = excluded.millis, seq = excluded.seq
                "#,
            )
            .bind(log)
            .bind(cursor.millis as i64)
            .bind(cursor.seq as i64)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO stream_entries (log, millis, seq, kind, payload) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(log)
            .bind(cursor.millis as i64)
            .bind(cursor.seq as i64)
            .bind(kind)
            .bind(payload)
            .execute(&mut *tx)
            .await?;

            let trimmed = sqlx::query(
                r#"
                DELETE FROM stream_entries
                WHERE log = ? AND id <= (
                    SELECT id FROM stream_entries WHERE log = ?
                    ORDER BY id DESC LIMIT 1 OFFSET ?
                )
                "#,
            )
            .bind(log)
            .bind(log)
            .bind(max_len.max(1) as i64)
            .execute(&mut *tx)
            .await?;
            if trimmed.rows_affected() > 0 {
                debug!("Trimmed {} entries from {}", trimmed.rows_affected(), log);
            }

            tx.commit().await?;
            cursor
        };
        self.hub.wake_log(log);
        Ok(cursor.to_string())
    }

    async fn read_after(
        &self,
        log: &str,
        after: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>> {
        let after = after.and_then(Cursor::parse);
        let (millis, seq, inclusive_start) = match after {
            Some(c) => (c.millis as i64, c.seq as i64, false),
            None => (0, 0, true),
        };
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));

        let rows = sqlx::query(
            r#"
            SELECT millis, seq, kind, payload FROM stream_entries
            WHERE log = ? AND (? OR millis > ? OR (millis = ? AND seq > ?))
            ORDER BY millis ASC, seq ASC
            LIMIT ?
            "#,
        )
        .bind(log)
        .bind(inclusive_start)
        .bind(millis)
        .bind(millis)
        .bind(seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn read_latest(&self, log: &str, count: usize) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT millis, seq, kind, payload FROM stream_entries
            WHERE log = ?
            ORDER BY millis DESC, seq DESC
            LIMIT ?
            "#,
        )
        .bind(log)
        .bind(i64::try_from(count).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn wait_read_after(
        &self,
        log: &str,
        after: Option<&str>,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<LogEntry>> {
        wait_for_entries(
            self,
            &self.hub,
            log,
            after,
            limit,
            timeout,
            Some(CROSS_PROCESS_RECHECK),
        )
        .await
    }

    async fn delete_log(&self, log: &str) -> Result<()> {
        sqlx::query("DELETE FROM stream_entries WHERE log = ?")
            .bind(log)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let current = self.live_versioned(key).await?.version;
        self.write_key(key, value, Self::fresh_version(current), ttl)
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_versioned(key).await?.value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("DELETE FROM stream_keys WHERE key = ? RETURNING expires_at")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => {
                let expires_at: Option<i64> = row.try_get("expires_at")?;
                expires_at.map_or(true, |at| at > now_millis() as i64)
            }
            None => false,
        })
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("DELETE FROM stream_keys WHERE key = ? RETURNING value, expires_at")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at: Option<i64> = row.try_get("expires_at")?;
        if expires_at.is_some_and(|at| at <= now_millis() as i64) {
            return Ok(None);
        }
        Ok(Some(row.try_get("value")?))
    }

    async fn get_versioned(&self, key: &str) -> Result<Versioned> {
        self.live_versioned(key).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let now = now_millis() as i64;
        let version = Self::fresh_version(expected_version);

        // Single statement so writers in other processes cannot interleave
        let result = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO stream_keys (key, value, version, expires_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    version = excluded.version,
                    expires_at = excluded.expires_at
                WHERE stream_keys.expires_at IS NOT NULL AND stream_keys.expires_at <= ?
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(version)
            .bind(ttl_deadline(ttl))
            .bind(now)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE stream_keys SET value = ?, version = ?, expires_at = ?
                WHERE key = ? AND version = ? AND (expires_at IS NULL OR expires_at > ?)
                "#,
            )
            .bind(value)
            .bind(version)
            .bind(ttl_deadline(ttl))
            .bind(key)
            .bind(expected_version as i64)
            .bind(now)
            .execute(&self.pool)
            .await?
        };
        Ok(result.rows_affected() == 1)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        Ok(self.hub.publish(channel, message))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        Ok(self.hub.subscribe(channel))
    }
}
