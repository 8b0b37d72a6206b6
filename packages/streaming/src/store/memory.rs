// ABOUTME: In-memory StreamStore for tests and single-process embedding
// ABOUTME: Logs are bounded deques; keys expire lazily against tokio time

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use super::{
    now_millis, wait_for_entries, Cursor, LogEntry, SignalHub, StreamStore, Subscription,
    Versioned,
};
use crate::error::Result;

#[derive(Default)]
struct LogState {
    entries: VecDeque<(Cursor, String, Option<String>)>,
    last: Cursor,
}

struct KeyEntry {
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

impl KeyEntry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

fn to_entry((cursor, kind, payload): &(Cursor, String, Option<String>)) -> LogEntry {
    LogEntry {
        id: cursor.to_string(),
        kind: kind.clone(),
        payload: payload.clone(),
    }
}

pub struct MemoryStreamStore {
    logs: Mutex<HashMap<String, LogState>>,
    keys: Mutex<HashMap<String, KeyEntry>>,
    versions: AtomicU64,
    hub: Arc<SignalHub>,
}

impl Default for MemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
            versions: AtomicU64::new(1),
            hub: Arc::new(SignalHub::new()),
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst)
    }

    /// Live value and version, dropping the key if it has expired
    fn live_key(keys: &mut HashMap<String, KeyEntry>, key: &str) -> Option<(String, u64)> {
        match keys.get(key) {
            Some(entry) if entry.is_live() => Some((entry.value.clone(), entry.version)),
            Some(_) => {
                keys.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn append(
        &self,
        log: &str,
        kind: &str,
        payload: Option<&str>,
        max_len: usize,
    ) -> Result<String> {
        let cursor = {
            let mut logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
            let state = logs.entry(log.to_string()).or_default();
            let cursor = state.last.next(now_millis());
            state.last = cursor;
            state
                .entries
                .push_back((cursor, kind.to_string(), payload.map(str::to_string)));
            while state.entries.len() > max_len.max(1) {
                state.entries.pop_front();
            }
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
        let logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        let Some(state) = logs.get(log) else {
            return Ok(Vec::new());
        };
        Ok(state
            .entries
            .iter()
            .filter(|(cursor, _, _)| after.map_or(true, |after| *cursor > after))
            .take(limit.unwrap_or(usize::MAX))
            .map(to_entry)
            .collect())
    }

    async fn read_latest(&self, log: &str, count: usize) -> Result<Vec<LogEntry>> {
        let logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        Ok(logs
            .get(log)
            .map(|state| state.entries.iter().rev().take(count).map(to_entry).collect())
            .unwrap_or_default())
    }

    async fn wait_read_after(
        &self,
        log: &str,
        after: Option<&str>,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<LogEntry>> {
        wait_for_entries(self, &self.hub, log, after, limit, timeout, None).await
    }

    async fn delete_log(&self, log: &str) -> Result<()> {
        let mut logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(state) = logs.get_mut(log) {
            // Keep `last` so cursors stay monotonic across clears
            state.entries.clear();
        }
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let version = self.next_version();
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                version,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        Ok(Self::live_key(&mut keys, key).map(|(value, _)| value))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        Ok(keys.remove(key).is_some_and(|entry| entry.is_live()))
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>> {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        Ok(keys
            .remove(key)
            .filter(KeyEntry::is_live)
            .map(|entry| entry.value))
    }

    async fn get_versioned(&self, key: &str) -> Result<Versioned> {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        Ok(match Self::live_key(&mut keys, key) {
            Some((value, version)) => Versioned {
                value: Some(value),
                version,
            },
            None => Versioned::default(),
        })
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        let current = Self::live_key(&mut keys, key).map_or(0, |(_, version)| version);
        if current != expected_version {
            return Ok(false);
        }
        keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                version: self.next_version(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        Ok(self.hub.publish(channel, message))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        Ok(self.hub.subscribe(channel))
    }
}
