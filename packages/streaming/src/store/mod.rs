// ABOUTME: Durable stream store abstraction: append-only logs, expiring keys, and pub/sub
// ABOUTME: Shared cursor type and the in-process signal hub used by both backends

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStreamStore;
pub use sqlite::SqliteStreamStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use crate::error::Result;

/// Buffered signals per channel before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 16;

/// Position of an entry in a log. Renders as `"<millis>-<seq>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cursor {
    pub millis: u64,
    pub seq: u64,
}

impl Cursor {
    /// Parse `"<millis>-<seq>"`. Anything else is `None` and callers treat it as absent.
    pub fn parse(raw: &str) -> Option<Self> {
        let (millis, seq) = raw.trim().split_once('-')?;
        Some(Self {
            millis: millis.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }

    /// Next cursor after `self` at wall-clock `now_millis`, strictly greater than `self`
    pub fn next(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self {
                millis: now_millis,
                seq: 0,
            }
        } else {
            Self {
                millis: self.millis,
                seq: self.seq + 1,
            }
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

pub(crate) fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// One log entry as stored and replayed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub kind: String,
    pub payload: Option<String>,
}

/// A key's value together with the version used for compare-and-set.
/// Absent keys report version 0.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Versioned {
    pub value: Option<String>,
    pub version: u64,
}

/// Receiver side of a pub/sub channel
pub struct Subscription {
    receiver: broadcast::Receiver<String>,
}

impl Subscription {
    /// Next message, or `None` once the channel is gone. Lagged gaps are skipped.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Subscription lagged, skipped {} signals", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Process-local fan-out for pub/sub messages and log-append wakeups
#[derive(Default)]
pub struct SignalHub {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    logs: Mutex<HashMap<String, Arc<Notify>>>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to current subscribers; returns how many received it
    pub fn publish(&self, channel: &str, message: &str) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        let delivered = match channels.get(channel) {
            Some(sender) => sender.send(message.to_string()).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            channels.remove(channel);
        }
        delivered
    }

    pub fn subscribe(&self, channel: &str) -> Subscription {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Subscription {
            receiver: sender.subscribe(),
        }
    }

    pub fn log_notify(&self, log: &str) -> Arc<Notify> {
        let mut logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        logs.entry(log.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn wake_log(&self, log: &str) {
        let logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(notify) = logs.get(log) {
            notify.notify_waiters();
        }
    }
}

/// Blocking read shared by the backends: re-read whenever the hub reports an append
/// to `log`, and at least every `recheck` for writers the hub cannot see.
pub(crate) async fn wait_for_entries<S>(
    store: &S,
    hub: &SignalHub,
    log: &str,
    after: Option<&str>,
    limit: usize,
    timeout: Duration,
    recheck: Option<Duration>,
) -> Result<Vec<LogEntry>>
where
    S: StreamStore + ?Sized,
{
    let notify = hub.log_notify(log);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        // Register before reading so an append between the read and the wait is not missed
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let entries = store.read_after(log, after, Some(limit)).await?;
        let now = tokio::time::Instant::now();
        if !entries.is_empty() || now >= deadline {
            return Ok(entries);
        }
        let wake_at = match recheck {
            Some(interval) => deadline.min(now + interval),
            None => deadline,
        };
        let _ = tokio::time::timeout_at(wake_at, notified).await;
    }
}

/// Storage behind the per-chat stream log, markers, queue slot, and cancel channel.
///
/// Log reads are FIFO. Cursors are strictly increasing per log, including across
/// `delete_log`, so a reader holding a cursor from before a clear still sees every
/// entry appended afterwards.
#[async_trait]
pub trait StreamStore: Send + Sync {
    // ==================== Logs ====================

    /// Append an entry, trimming the oldest beyond `max_len`. Returns the new cursor.
    async fn append(
        &self,
        log: &str,
        kind: &str,
        payload: Option<&str>,
        max_len: usize,
    ) -> Result<String>;

    /// Entries strictly after `after` (from the start when `None` or malformed)
    async fn read_after(
        &self,
        log: &str,
        after: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>>;

    /// Newest `count` entries, newest first
    async fn read_latest(&self, log: &str, count: usize) -> Result<Vec<LogEntry>>;

    /// Like `read_after`, but waits up to `timeout` for something to arrive.
    /// An empty result means the wait timed out.
    async fn wait_read_after(
        &self,
        log: &str,
        after: Option<&str>,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<LogEntry>>;

    async fn delete_log(&self, log: &str) -> Result<()>;

    // ==================== Keys ====================

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns whether a live key was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically read and remove
    async fn get_del(&self, key: &str) -> Result<Option<String>>;

    async fn get_versioned(&self, key: &str) -> Result<Versioned>;

    /// Write only if the key is still at `expected_version` (0 = absent)
    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    // ==================== Pub/Sub ====================

    /// Fire-and-forget broadcast; returns the number of receivers
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}
