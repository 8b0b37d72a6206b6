// ABOUTME: Keyed registry of open PTY sessions per sandbox
// ABOUTME: Backends store their own session handles here and drain them on kill, delete, or cleanup

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// sandbox id -> session id -> backend handle
pub struct PtyRegistry<H> {
    sessions: Mutex<HashMap<String, HashMap<String, H>>>,
}

impl<H> Default for PtyRegistry<H> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<H> PtyRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, H>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| {
            warn!("PTY registry mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn insert(&self, sandbox_id: &str, session_id: &str, handle: H) {
        self.lock()
            .entry(sandbox_id.to_string())
            .or_default()
            .insert(session_id.to_string(), handle);
    }

    /// Run `f` against a session while the registry lock is held.
    pub fn with_session<R>(
        &self,
        sandbox_id: &str,
        session_id: &str,
        f: impl FnOnce(&mut H) -> R,
    ) -> Option<R> {
        let mut sessions = self.lock();
        sessions
            .get_mut(sandbox_id)
            .and_then(|by_id| by_id.get_mut(session_id))
            .map(f)
    }

    pub fn remove(&self, sandbox_id: &str, session_id: &str) -> Option<H> {
        let mut sessions = self.lock();
        let by_id = sessions.get_mut(sandbox_id)?;
        let handle = by_id.remove(session_id);
        if by_id.is_empty() {
            sessions.remove(sandbox_id);
        }
        handle
    }

    /// Remove every session of one sandbox
    pub fn drain_sandbox(&self, sandbox_id: &str) -> Vec<(String, H)> {
        self.lock()
            .remove(sandbox_id)
            .map(|by_id| by_id.into_iter().collect())
            .unwrap_or_default()
    }

    /// Remove every session of every sandbox
    pub fn drain_all(&self) -> Vec<(String, String, H)> {
        self.lock()
            .drain()
            .flat_map(|(sandbox_id, by_id)| {
                by_id
                    .into_iter()
                    .map(move |(session_id, handle)| (sandbox_id.clone(), session_id, handle))
            })
            .collect()
    }

    pub fn count(&self, sandbox_id: &str) -> usize {
        self.lock().get(sandbox_id).map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_cleans_up_empty_sandboxes() {
        let registry = PtyRegistry::new();
        registry.insert("sb1", "p1", 1u32);
        registry.insert("sb1", "p2", 2u32);
        registry.insert("sb2", "p3", 3u32);

        assert_eq!(registry.with_session("sb1", "p2", |h| *h), Some(2));
        assert_eq!(registry.remove("sb1", "p1"), Some(1));
        assert_eq!(registry.count("sb1"), 1);
        assert_eq!(registry.remove("sb1", "p2"), Some(2));
        assert_eq!(registry.count("sb1"), 0);
        assert!(registry.remove("sb1", "p2").is_none());

        let drained = registry.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(registry.count("sb2"), 0);
    }
}
