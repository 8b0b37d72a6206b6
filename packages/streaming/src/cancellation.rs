// ABOUTME: One cancellation token per running turn, fed by the chat's cancel channel
// ABOUTME: Local shutdown and remote cancel requests both end up cancelling the same token

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::keys;
use crate::store::StreamStore;

#[derive(Clone)]
pub struct CancellationHandler {
    chat_id: String,
    store: Arc<dyn StreamStore>,
    token: CancellationToken,
    requested: Arc<AtomicBool>,
}

impl CancellationHandler {
    pub fn new(chat_id: impl Into<String>, store: Arc<dyn StreamStore>, token: CancellationToken) -> Self {
        Self {
            chat_id: chat_id.into(),
            store,
            token,
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn was_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True when a client asked for the cancel, as opposed to a local shutdown
    pub fn cancel_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Cancel from inside this process
    pub fn cancel(&self) {
        self.token.cancel();
    }

    fn trigger_requested(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Watch the chat's cancel channel until the token fires. A cancel published
    /// before the subscription existed is caught through the revoked flag.
    pub async fn spawn_monitor(&self) -> JoinHandle<()> {
        let handler = self.clone();
        let subscription = self
            .store
            .subscribe(&keys::cancel_channel(&self.chat_id))
            .await;

        tokio::spawn(async move {
            let mut subscription = match subscription {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(
                        "Cancellation monitor for chat {} could not subscribe: {}",
                        handler.chat_id, e
                    );
                    return;
                }
            };

            match handler.store.get(&keys::revoked_key(&handler.chat_id)).await {
                Ok(Some(_)) => {
                    info!("Chat {} was revoked before the stream started", handler.chat_id);
                    handler.trigger_requested();
                    return;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to read revoked flag for chat {}: {}", handler.chat_id, e),
            }

            tokio::select! {
                _ = handler.token.cancelled() => {}
                message = subscription.recv() => {
                    if message.is_some() {
                        info!("Stream cancellation received for chat {}", handler.chat_id);
                        handler.trigger_requested();
                    }
                }
            }
        })
    }
}

/// Abort a monitor task and wait for it to finish
pub async fn stop_monitor(handle: JoinHandle<()>) {
    handle.abort();
    let _ = handle.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStreamStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_published_cancel_marks_requested() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = CancellationHandler::new("c1", store.clone(), CancellationToken::new());
        let monitor = handler.spawn_monitor().await;

        store.publish("chat:c1:cancel", "cancel").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handler.token().cancelled())
            .await
            .unwrap();
        assert!(handler.cancel_requested());
        stop_monitor(monitor).await;
    }

    #[tokio::test]
    async fn test_revoked_flag_catches_early_cancel() {
        let store = Arc::new(MemoryStreamStore::new());
        store
            .set_with_ttl("chat:c1:revoked", "1", Duration::from_secs(60))
            .await
            .unwrap();
        let handler = CancellationHandler::new("c1", store, CancellationToken::new());
        let monitor = handler.spawn_monitor().await;

        tokio::time::timeout(Duration::from_secs(1), handler.token().cancelled())
            .await
            .unwrap();
        assert!(handler.cancel_requested());
        stop_monitor(monitor).await;
    }

    #[tokio::test]
    async fn test_local_cancel_is_not_a_request() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = CancellationHandler::new("c1", store, CancellationToken::new());
        let monitor = handler.spawn_monitor().await;

        handler.cancel();
        assert!(handler.was_cancelled());
        assert!(!handler.cancel_requested());
        stop_monitor(monitor).await;
    }
}
