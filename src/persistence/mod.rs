//! Persistence layer.
//!
//! The [`Repository`] trait is the storage contract; the gateway is the only
//! component that writes through it.  [`SqliteRepository`] is the shipped
//! implementation.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{AgentRun, Channel, Chat, Event, Message};

/// Default window for [`Repository::tail_events`].
pub const DEFAULT_EVENT_TAIL_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Storage contract for channels, chats, messages, runs, and the event
/// audit log.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn upsert_channel(&self, channel: &Channel) -> Result<()>;
    async fn list_channels(&self) -> Result<Vec<Channel>>;

    async fn upsert_chat(&self, chat: &Chat) -> Result<()>;
    async fn list_chats(&self, channel_id: Option<&str>) -> Result<Vec<Chat>>;

    async fn add_message(&self, message: &Message) -> Result<()>;
    /// The most recent `limit` messages of a chat, in chronological order.
    async fn list_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<Message>>;

    async fn upsert_run(&self, run: &AgentRun) -> Result<()>;
    async fn get_run(&self, run_id: &str) -> Result<Option<AgentRun>>;

    async fn add_event(&self, event: &Event) -> Result<()>;
    /// The most recent `limit` events (optionally scoped to a run and/or to
    /// `seq > after_seq`), ordered by seq ascending.
    async fn tail_events(
        &self,
        run_id: Option<&str>,
        after_seq: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Event>>;
}

pub use sqlite::SqliteRepository;
