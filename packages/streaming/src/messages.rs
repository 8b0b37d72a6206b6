// ABOUTME: Chat and message persistence used by the orchestrator and the HTTP layer
// ABOUTME: MessageStore trait with a SQLite implementation over runtime sqlx queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StreamingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(StreamingError::Store(format!("Invalid message role: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStreamStatus {
    InProgress,
    Completed,
    Failed,
    Interrupted,
}

impl MessageStreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "interrupted" => Ok(Self::Interrupted),
            _ => Err(StreamingError::Store(format!("Invalid stream status: {}", s))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub sandbox_id: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub role: MessageRole,
    pub content: String,
    pub model_id: Option<String>,
    pub stream_status: Option<MessageStreamStatus>,
    pub total_cost_usd: f64,
    pub checkpoint_id: Option<String>,
    pub session_id: Option<String>,
    pub attachments: Option<Vec<Value>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub model_id: Option<String>,
    pub stream_status: Option<MessageStreamStatus>,
    pub attachments: Option<Vec<Value>>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>, attachments: Option<Vec<Value>>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            model_id: None,
            stream_status: None,
            attachments,
        }
    }

    /// Empty assistant row that a stream will fill in
    pub fn pending_assistant(model_id: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: String::new(),
            model_id: Some(model_id.into()),
            stream_status: Some(MessageStreamStatus::InProgress),
            attachments: None,
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_chat(
        &self,
        user_id: &str,
        title: &str,
        sandbox_id: Option<&str>,
    ) -> Result<Chat>;

    async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>>;

    async fn set_chat_sandbox(&self, chat_id: &str, sandbox_id: &str) -> Result<()>;

    async fn update_chat_session(&self, chat_id: &str, session_id: &str) -> Result<()>;

    async fn create_message(&self, chat_id: &str, message: NewMessage) -> Result<Message>;

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>>;

    /// Oldest first
    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>>;

    async fn latest_assistant_message(&self, chat_id: &str) -> Result<Option<Message>>;

    async fn update_status(&self, message_id: &str, status: MessageStreamStatus) -> Result<()>;

    /// Persist a finished (or abandoned) turn in one write
    async fn save_content(
        &self,
        message_id: &str,
        content: &str,
        total_cost_usd: f64,
        status: MessageStreamStatus,
    ) -> Result<()>;

    async fn set_checkpoint(&self, message_id: &str, checkpoint_id: &str) -> Result<()>;

    async fn set_message_session(&self, message_id: &str, session_id: &str) -> Result<()>;
}

pub struct SqliteMessageStore {
    pool: SqlitePool,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StreamingError::Store(format!("Invalid timestamp {}: {}", raw, e)))
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_chat(row: &SqliteRow) -> Result<Chat> {
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(Chat {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            title: row.try_get("title")?,
            sandbox_id: row.try_get("sandbox_id")?,
            session_id: row.try_get("session_id")?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }

    fn row_to_message(row: &SqliteRow) -> Result<Message> {
        let role: String = row.try_get("role")?;
        let status: Option<String> = row.try_get("stream_status")?;
        let attachments: Option<String> = row.try_get("attachments")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Message {
            id: row.try_get("id")?,
            chat_id: row.try_get("chat_id")?,
            role: MessageRole::from_str(&role)?,
            content: row.try_get("content")?,
            model_id: row.try_get("model_id")?,
            stream_status: status
                .as_deref()
                .map(MessageStreamStatus::from_str)
                .transpose()?,
            total_cost_usd: row.try_get("total_cost_usd")?,
            checkpoint_id: row.try_get("checkpoint_id")?,
            session_id: row.try_get("session_id")?,
            attachments: attachments
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: parse_timestamp(&created_at)?,
        })
    }

    async fn update_message_field(
        &self,
        message_id: &str,
        sql: &'static str,
        value: &str,
    ) -> Result<()> {
        let result = sqlx::query(sql)
            .bind(value)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StreamingError::message_not_found(message_id));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn create_chat(
        &self,
        user_id: &str,
        title: &str,
        sandbox_id: Option<&str>,
    ) -> Result<Chat> {
        let now = Utc::now();
        let chat = Chat {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            sandbox_id: sandbox_id.map(str::to_string),
            session_id: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO chats (id, user_id, title, sandbox_id, session_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(&chat.id)
        .bind(&chat.user_id)
        .bind(&chat.title)
        .bind(&chat.sandbox_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!("Created chat {}", chat.id);
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>> {
        let row = sqlx::query("SELECT * FROM chats WHERE id = ?")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_chat).transpose()
    }

    async fn set_chat_sandbox(&self, chat_id: &str, sandbox_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE chats SET sandbox_id = ?, updated_at = ? WHERE id = ?")
            .bind(sandbox_id)
            .bind(Utc::now().to_rfc3339())
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StreamingError::chat_not_found(chat_id));
        }
        Ok(())
    }

    async fn update_chat_session(&self, chat_id: &str, session_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE chats SET session_id = ?, updated_at = ? WHERE id = ?")
            .bind(session_id)
            .bind(Utc::now().to_rfc3339())
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StreamingError::chat_not_found(chat_id));
        }
        Ok(())
    }

    async fn create_message(&self, chat_id: &str, message: NewMessage) -> Result<Message> {
        let created = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            role: message.role,
            content: message.content,
            model_id: message.model_id,
            stream_status: message.stream_status,
            total_cost_usd: 0.0,
            checkpoint_id: None,
            session_id: None,
            attachments: message.attachments,
            created_at: Utc::now(),
        };
        let attachments = created
            .attachments
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages (
                id, chat_id, role, content, model_id, stream_status,
                total_cost_usd, attachments, created_at, seq
            )
            SELECT ?, ?, ?, ?, ?, ?, 0, ?, ?, COALESCE(MAX(seq), 0) + 1
            FROM messages WHERE chat_id = ?
            "#,
        )
        .bind(&created.id)
        .bind(chat_id)
        .bind(created.role.as_str())
        .bind(&created.content)
        .bind(&created.model_id)
        .bind(created.stream_status.map(|s| s.as_str()))
        .bind(attachments)
        .bind(created.created_at.to_rfc3339())
        .bind(chat_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(created),
            // Foreign key violation: unknown chat
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                Err(StreamingError::chat_not_found(chat_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE chat_id = ? ORDER BY seq ASC")
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn latest_assistant_message(&self, chat_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE chat_id = ? AND role = 'assistant'
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn update_status(&self, message_id: &str, status: MessageStreamStatus) -> Result<()> {
        self.update_message_field(
            message_id,
            "UPDATE messages SET stream_status = ? WHERE id = ?",
            status.as_str(),
        )
        .await
    }

    async fn save_content(
        &self,
        message_id: &str,
        content: &str,
        total_cost_usd: f64,
        status: MessageStreamStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET content = ?, total_cost_usd = ?, stream_status = ?
            WHERE id = ?
            "#,
        )
        .bind(content)
        .bind(total_cost_usd)
        .bind(status.as_str())
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StreamingError::message_not_found(message_id));
        }
        Ok(())
    }

    async fn set_checkpoint(&self, message_id: &str, checkpoint_id: &str) -> Result<()> {
        self.update_message_field(
            message_id,
            "UPDATE messages SET checkpoint_id = ? WHERE id = ?",
            checkpoint_id,
        )
        .await
    }

    async fn set_message_session(&self, message_id: &str, session_id: &str) -> Result<()> {
        self.update_message_field(
            message_id,
            "UPDATE messages SET session_id = ? WHERE id = ?",
            session_id,
        )
        .await
    }
}
