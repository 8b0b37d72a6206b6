// ABOUTME: Server-Sent Events plumbing for chat streams
// ABOUTME: Per-IP connection limiting, guard-holding stream wrapper, and reader event framing

use agentbox_config::{constants, defaults, env_or};
use agentbox_streaming::ReaderEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Error returned when SSE connection limit is exceeded
#[derive(Debug)]
pub struct SseConnectionLimitExceeded;

/// Tracks concurrent SSE connections per IP address
#[derive(Clone)]
pub struct SseConnectionTracker {
    connections: Arc<Mutex<HashMap<IpAddr, usize>>>,
    max_connections_per_ip: usize,
}

impl Default for SseConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SseConnectionTracker {
    pub fn new() -> Self {
        Self::with_limit(env_or(
            constants::AGENTBOX_SSE_MAX_CONNECTIONS_PER_IP,
            defaults::SSE_MAX_CONNECTIONS_PER_IP,
            |&v| v > 0 && v <= 100,
        ))
    }

    pub fn with_limit(max_connections_per_ip: usize) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            max_connections_per_ip,
        }
    }

    /// Try to acquire a connection slot for the given IP
    pub fn try_acquire(
        &self,
        ip: IpAddr,
    ) -> Result<SseConnectionGuard, SseConnectionLimitExceeded> {
        let mut connections = self.connections.lock().unwrap_or_else(|poisoned| {
            warn!("SSE connection tracker mutex poisoned, recovering");
            poisoned.into_inner()
        });
        let count = connections.entry(ip).or_insert(0);

        if *count >= self.max_connections_per_ip {
            warn!(
                ip = %ip,
                current = %count,
                max = self.max_connections_per_ip,
                "SSE connection limit exceeded"
            );
            return Err(SseConnectionLimitExceeded);
        }

        *count += 1;
        info!(
            ip = %ip,
            count = %count,
            max = self.max_connections_per_ip,
            "SSE connection acquired"
        );

        Ok(SseConnectionGuard {
            ip,
            tracker: self.clone(),
        })
    }

    fn release(&self, ip: IpAddr) {
        let mut connections = self.connections.lock().unwrap_or_else(|poisoned| {
            warn!("SSE connection tracker mutex poisoned, recovering");
            poisoned.into_inner()
        });
        if let Some(count) = connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            info!(ip = %ip, remaining = %count, "SSE connection released");

            if *count == 0 {
                connections.remove(&ip);
            }
        }
    }

    /// Open connections for `ip`
    pub fn active(&self, ip: IpAddr) -> usize {
        let connections = self
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        connections.get(&ip).copied().unwrap_or(0)
    }
}

/// Releases the connection slot when dropped
pub struct SseConnectionGuard {
    ip: IpAddr,
    tracker: SseConnectionTracker,
}

impl Drop for SseConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release(self.ip);
    }
}

/// Keeps the slot held for as long as the response body is alive
pub struct GuardedSseStream<S> {
    stream: std::pin::Pin<Box<S>>,
    _guard: SseConnectionGuard,
}

impl<S> GuardedSseStream<S> {
    pub fn new(stream: S, guard: SseConnectionGuard) -> Self {
        Self {
            stream: Box::pin(stream),
            _guard: guard,
        }
    }
}

impl<S, T, E> Stream for GuardedSseStream<S>
where
    S: Stream<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

/// SSE response with the standard keep-alive comment
pub fn create_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}

/// Frame a reader event. Synthetic events carry no id so clients keep their cursor.
pub fn reader_event_to_sse(event: ReaderEvent) -> Event {
    let framed = Event::default().event(event.event).data(event.data);
    match event.id {
        Some(id) => framed.id(id),
        None => framed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracker_enforces_limit() {
        let tracker = SseConnectionTracker::with_limit(2);
        let ip = "127.0.0.1".parse().unwrap();

        let first = tracker.try_acquire(ip).unwrap();
        let _second = tracker.try_acquire(ip).unwrap();
        assert!(tracker.try_acquire(ip).is_err());

        drop(first);
        assert_eq!(tracker.active(ip), 1);
        assert!(tracker.try_acquire(ip).is_ok());
    }

    #[test]
    fn test_limits_are_per_ip() {
        let tracker = SseConnectionTracker::with_limit(1);
        let ip1 = "127.0.0.1".parse().unwrap();
        let ip2 = "127.0.0.2".parse().unwrap();

        let _guard1 = tracker.try_acquire(ip1).unwrap();
        let _guard2 = tracker.try_acquire(ip2).unwrap();
        assert!(tracker.try_acquire(ip1).is_err());
    }

    #[test]
    fn test_released_entries_are_removed() {
        let tracker = SseConnectionTracker::with_limit(3);
        let ip = "10.0.0.1".parse().unwrap();
        {
            let _guard = tracker.try_acquire(ip).unwrap();
            assert_eq!(tracker.active(ip), 1);
        }
        assert_eq!(tracker.active(ip), 0);
    }
}
