// ABOUTME: Consumer side of a chat stream: backlog replay from a cursor, then live tailing
// ABOUTME: Ends on the first terminal entry, or with a synthetic cancelled event on a cancel signal

use futures::Stream;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancellation::stop_monitor;
use crate::events::StreamEventKind;
use crate::keys;
use crate::store::{Cursor, LogEntry, StreamStore};

/// Entries fetched per live poll
const LIVE_BATCH: usize = 10;
/// Pause after a failed live read before retrying
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// One server-sent event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderEvent {
    /// Log cursor; `None` for synthetic events
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

impl ReaderEvent {
    fn from_entry(entry: LogEntry) -> Self {
        Self {
            id: Some(entry.id),
            event: entry.kind,
            data: entry.payload.unwrap_or_default(),
        }
    }

    fn synthetic_complete(status: &str) -> Self {
        Self {
            id: None,
            event: StreamEventKind::Complete.as_str().to_string(),
            data: json!({ "status": status }).to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        StreamEventKind::is_terminal(&self.event)
    }
}

/// Watches the chat's cancel channel while a reader tails the log
struct CancelWatcher {
    handle: Option<JoinHandle<()>>,
}

impl CancelWatcher {
    async fn spawn(store: Arc<dyn StreamStore>, chat_id: &str, flag: CancellationToken) -> Self {
        let subscription = store.subscribe(&keys::cancel_channel(chat_id)).await;
        let chat_id = chat_id.to_string();
        let handle = tokio::spawn(async move {
            let mut subscription = match subscription {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!("Reader for chat {} could not watch for cancels: {}", chat_id, e);
                    return;
                }
            };
            tokio::select! {
                _ = flag.cancelled() => {}
                message = subscription.recv() => {
                    if message.is_some() {
                        info!("Reader for chat {} received a cancel signal", chat_id);
                        flag.cancel();
                    }
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            stop_monitor(handle).await;
        }
    }
}

impl Drop for CancelWatcher {
    // Covers a consumer that drops the stream mid-poll
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct StreamReader {
    store: Arc<dyn StreamStore>,
    poll_interval: Duration,
}

impl StreamReader {
    pub fn new(store: Arc<dyn StreamStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    /// Events after `last_event_id` until a terminal entry. A malformed or
    /// trimmed cursor replays whatever the log still holds.
    pub fn events(
        &self,
        chat_id: impl Into<String>,
        last_event_id: Option<String>,
    ) -> impl Stream<Item = ReaderEvent> + Send + 'static {
        let store = self.store.clone();
        let poll_interval = self.poll_interval;
        let chat_id = chat_id.into();

        async_stream::stream! {
            let log = keys::stream_key(&chat_id);
            let mut last_id = last_event_id.filter(|id| Cursor::parse(id).is_some());

            match store.read_after(&log, last_id.as_deref(), None).await {
                Ok(backlog) => {
                    for entry in backlog {
                        let terminal = StreamEventKind::is_terminal(&entry.kind);
                        last_id = Some(entry.id.clone());
                        yield ReaderEvent::from_entry(entry);
                        if terminal {
                            return;
                        }
                    }
                }
                Err(e) => warn!("Failed to replay stream for chat {}: {}", chat_id, e),
            }

            let flag = CancellationToken::new();
            let mut watcher = CancelWatcher::spawn(store.clone(), &chat_id, flag.clone()).await;
            let mut ending: Option<ReaderEvent> = None;

            loop {
                if flag.is_cancelled() || revoked(store.as_ref(), &chat_id).await {
                    ending = Some(ReaderEvent::synthetic_complete("cancelled"));
                    break;
                }

                let batch = tokio::select! {
                    _ = flag.cancelled() => None,
                    batch = store.wait_read_after(&log, last_id.as_deref(), LIVE_BATCH, poll_interval) => Some(batch),
                };
                let entries = match batch {
                    None => continue,
                    Some(Ok(entries)) => entries,
                    Some(Err(e)) => {
                        debug!("Live read for chat {} failed, retrying: {}", chat_id, e);
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                };

                if entries.is_empty() {
                    if !task_active(store.as_ref(), &chat_id).await {
                        // Producer gone; pick up a terminal it may have written just before leaving
                        match store.read_after(&log, last_id.as_deref(), Some(LIVE_BATCH)).await {
                            Ok(late) if !late.is_empty() => {
                                let mut terminal = false;
                                for entry in late {
                                    terminal = StreamEventKind::is_terminal(&entry.kind);
                                    last_id = Some(entry.id.clone());
                                    yield ReaderEvent::from_entry(entry);
                                    if terminal {
                                        break;
                                    }
                                }
                                if terminal {
                                    break;
                                }
                                continue;
                            }
                            _ => {
                                ending = Some(ReaderEvent::synthetic_complete("inactive"));
                                break;
                            }
                        }
                    }
                    continue;
                }

                let mut terminal = false;
                for entry in entries {
                    if last_id.as_deref() == Some(entry.id.as_str()) {
                        continue;
                    }
                    terminal = StreamEventKind::is_terminal(&entry.kind);
                    last_id = Some(entry.id.clone());
                    yield ReaderEvent::from_entry(entry);
                    if terminal {
                        break;
                    }
                }
                if terminal {
                    break;
                }
            }

            watcher.stop().await;
            if let Some(event) = ending {
                yield event;
            }
        }
    }
}

async fn revoked(store: &dyn StreamStore, chat_id: &str) -> bool {
    match store.get(&keys::revoked_key(chat_id)).await {
        Ok(flag) => flag.is_some(),
        Err(e) => {
            debug!("Failed to read revoked flag for chat {}: {}", chat_id, e);
            false
        }
    }
}

async fn task_active(store: &dyn StreamStore, chat_id: &str) -> bool {
    match store.get(&keys::task_key(chat_id)).await {
        Ok(marker) => marker.is_some(),
        // Unknown counts as alive; the next poll checks again
        Err(_) => true,
    }
}
