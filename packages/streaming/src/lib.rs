// ABOUTME: Chat stream production and consumption for Agentbox
// ABOUTME: Durable per-chat log, orchestrator, queue injection, cancellation, worker, and replay reader

pub mod agent;
pub mod cancellation;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod injector;
pub mod keys;
pub mod messages;
pub mod orchestrator;
pub mod publisher;
pub mod queue;
pub mod reader;
pub mod status;
pub mod store;
pub mod worker;

pub use agent::AgentSession;
pub use cancellation::CancellationHandler;
pub use config::StreamingConfig;
pub use db::open_pool;
pub use error::{Result, StreamingError};
pub use events::{StreamEvent, StreamEventKind, ToolPayload, ToolStatus};
pub use injector::QueueInjector;
pub use messages::{
    Chat, Message, MessageRole, MessageStore, MessageStreamStatus, NewMessage, SqliteMessageStore,
};
pub use orchestrator::{StreamContext, StreamOrchestrator, StreamSummary, TurnOutcome};
pub use publisher::{Payload, QueueNotice, StreamPublisher};
pub use queue::{QueueService, QueueSubmission, QueueUpsertResponse, QueuedMessage};
pub use reader::{ReaderEvent, StreamReader};
pub use status::{request_cancel, stream_status, StreamStatus, TaskLiveness};
pub use store::{Cursor, LogEntry, MemoryStreamStore, SqliteStreamStore, StreamStore, Subscription};
pub use worker::{ChatRequest, ChatWorker, ContinuationDispatcher, WorkerDeps};
