//! Durable message log, one ordered stream per room.
//!
//! The store never assigns `seq`: callers hand it a message whose slot the
//! room's writer has already reserved, and the store rejects a slot that is
//! already taken. Deletion is a tombstone; rows are never removed.

mod memory;
mod postgres;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;
use workshop_chat_common::types::ChatMessage;

pub use memory::MemoryMessageStore;

/// Upper bound for any single history page.
pub const MAX_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("message {message_id} not found")]
    NotFound { message_id: Uuid },
    #[error("seq {seq} is already taken in room {room_id}")]
    SeqConflict { room_id: Uuid, seq: i64 },
    #[error("message store unavailable: {0}")]
    Unavailable(String),
    #[error("stored row is invalid: {0}")]
    InvalidRow(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        Self::Unavailable(error.to_string())
    }
}

#[derive(Clone)]
pub enum MessageStore {
    Postgres(PgPool),
    Memory(MemoryMessageStore),
}

impl MessageStore {
    pub fn memory() -> Self {
        Self::Memory(MemoryMessageStore::default())
    }

    /// Persists a message in the slot given by `message.seq`.
    pub async fn append(&self, message: &ChatMessage) -> Result<i64, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::append(pool, message).await,
            Self::Memory(store) => store.append(message).await,
        }
    }

    /// Overwrites the body of a live message. Tombstones are reported as not found.
    pub async fn update(
        &self,
        message_id: Uuid,
        body: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<ChatMessage, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::update(pool, message_id, body, edited_at).await,
            Self::Memory(store) => store.update(message_id, body, edited_at).await,
        }
    }

    pub async fn tombstone(
        &self,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> Result<ChatMessage, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::tombstone(pool, message_id, deleted_at).await,
            Self::Memory(store) => store.tombstone(message_id, deleted_at).await,
        }
    }

    pub async fn get(&self, message_id: Uuid) -> Result<Option<ChatMessage>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::get(pool, message_id).await,
            Self::Memory(store) => store.get(message_id).await,
        }
    }

    /// Most recent `limit` messages of a room, ascending by `seq`, tombstones included.
    pub async fn list_recent(
        &self,
        room_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.list_before(room_id, None, limit).await
    }

    /// Up to `limit` messages with `seq < before_seq`, ascending by `seq`.
    pub async fn list_before(
        &self,
        room_id: Uuid,
        before_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        match self {
            Self::Postgres(pool) => postgres::list_before(pool, room_id, before_seq, limit).await,
            Self::Memory(store) => store.list_before(room_id, before_seq, limit).await,
        }
    }

    /// Highest persisted `seq` for the room, 0 when the room has no messages.
    pub async fn max_seq(&self, room_id: Uuid) -> Result<i64, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::max_seq(pool, room_id).await,
            Self::Memory(store) => store.max_seq(room_id).await,
        }
    }
}
