// ABOUTME: Per-chat key layout in the stream store
// ABOUTME: Task marker, event log, revoked flag, cancel channel, and queued message

pub fn task_key(chat_id: &str) -> String {
    format!("chat:{}:task", chat_id)
}

pub fn stream_key(chat_id: &str) -> String {
    format!("chat:{}:stream", chat_id)
}

pub fn revoked_key(chat_id: &str) -> String {
    format!("chat:{}:revoked", chat_id)
}

/// Broadcast channel, not a stored key
pub fn cancel_channel(chat_id: &str) -> String {
    format!("chat:{}:cancel", chat_id)
}

pub fn queue_key(chat_id: &str) -> String {
    format!("chat:{}:queue", chat_id)
}
