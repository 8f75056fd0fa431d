use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info_span, Instrument};
use uuid::Uuid;
use workshop_chat_common::types::{ChatMessage, MessageKind};

use super::StoreError;

const UNIQUE_VIOLATION: &str = "23505";

const MESSAGE_COLUMNS: &str = "
    id, room_id, author_id, author_name, body, kind, attachment_ref,
    seq, created_at, edited_at, deleted_at
";

#[derive(Debug, sqlx::FromRow)]
struct ChatMessageRow {
    id: Uuid,
    room_id: Uuid,
    author_id: Uuid,
    author_name: String,
    body: String,
    kind: String,
    attachment_ref: Option<String>,
    seq: i64,
    created_at: DateTime<Utc>,
    edited_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<ChatMessageRow> for ChatMessage {
    type Error = StoreError;

    fn try_from(row: ChatMessageRow) -> Result<Self, Self::Error> {
        let kind = MessageKind::from_db_value(&row.kind).ok_or_else(|| {
            StoreError::InvalidRow(format!("message {} has unknown kind '{}'", row.id, row.kind))
        })?;

        Ok(Self {
            id: row.id,
            room_id: row.room_id,
            author_id: row.author_id,
            author_name: row.author_name,
            body: row.body,
            kind,
            attachment_ref: row.attachment_ref,
            seq: row.seq,
            created_at: row.created_at,
            edited_at: row.edited_at,
            deleted_at: row.deleted_at,
        })
    }
}

pub(super) async fn append(pool: &PgPool, message: &ChatMessage) -> Result<i64, StoreError> {
    let result = sqlx::query(
        "
        INSERT INTO chat_messages
            (id, room_id, author_id, author_name, body, kind, attachment_ref, seq, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ",
    )
    .bind(message.id)
    .bind(message.room_id)
    .bind(message.author_id)
    .bind(&message.author_name)
    .bind(&message.body)
    .bind(message.kind.as_str())
    .bind(message.attachment_ref.as_deref())
    .bind(message.seq)
    .bind(message.created_at)
    .execute(pool)
    .instrument(info_span!(
        "chat.store.append",
        room_id = %message.room_id,
        seq = message.seq
    ))
    .await;

    match result {
        Ok(_) => Ok(message.seq),
        Err(sqlx::Error::Database(db_error))
            if db_error.code().as_deref() == Some(UNIQUE_VIOLATION) =>
        {
            Err(StoreError::SeqConflict { room_id: message.room_id, seq: message.seq })
        }
        Err(error) => Err(error.into()),
    }
}

pub(super) async fn update(
    pool: &PgPool,
    message_id: Uuid,
    body: &str,
    edited_at: DateTime<Utc>,
) -> Result<ChatMessage, StoreError> {
    let sql = format!(
        "
        UPDATE chat_messages
        SET body = $2, edited_at = $3
        WHERE id = $1 AND deleted_at IS NULL
        RETURNING {MESSAGE_COLUMNS}
        "
    );

    sqlx::query_as::<_, ChatMessageRow>(&sql)
        .bind(message_id)
        .bind(body)
        .bind(edited_at)
        .fetch_optional(pool)
        .instrument(info_span!("chat.store.update", message_id = %message_id))
        .await?
        .ok_or(StoreError::NotFound { message_id })?
        .try_into()
}

pub(super) async fn tombstone(
    pool: &PgPool,
    message_id: Uuid,
    deleted_at: DateTime<Utc>,
) -> Result<ChatMessage, StoreError> {
    let sql = format!(
        "
        UPDATE chat_messages
        SET deleted_at = $2
        WHERE id = $1 AND deleted_at IS NULL
        RETURNING {MESSAGE_COLUMNS}
        "
    );

    sqlx::query_as::<_, ChatMessageRow>(&sql)
        .bind(message_id)
        .bind(deleted_at)
        .fetch_optional(pool)
        .instrument(info_span!("chat.store.tombstone", message_id = %message_id))
        .await?
        .ok_or(StoreError::NotFound { message_id })?
        .try_into()
}

pub(super) async fn get(pool: &PgPool, message_id: Uuid) -> Result<Option<ChatMessage>, StoreError> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE id = $1");

    sqlx::query_as::<_, ChatMessageRow>(&sql)
        .bind(message_id)
        .fetch_optional(pool)
        .instrument(info_span!("chat.store.get", message_id = %message_id))
        .await?
        .map(ChatMessage::try_from)
        .transpose()
}

pub(super) async fn list_before(
    pool: &PgPool,
    room_id: Uuid,
    before_seq: Option<i64>,
    limit: usize,
) -> Result<Vec<ChatMessage>, StoreError> {
    let sql = format!(
        "
        SELECT * FROM (
            SELECT {MESSAGE_COLUMNS}
            FROM chat_messages
            WHERE room_id = $1
              AND ($2::BIGINT IS NULL OR seq < $2)
            ORDER BY seq DESC
            LIMIT $3
        ) AS page
        ORDER BY seq ASC
        "
    );
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);

    sqlx::query_as::<_, ChatMessageRow>(&sql)
        .bind(room_id)
        .bind(before_seq)
        .bind(limit)
        .fetch_all(pool)
        .instrument(info_span!("chat.store.list_before", room_id = %room_id, limit))
        .await?
        .into_iter()
        .map(ChatMessage::try_from)
        .collect()
}

pub(super) async fn max_seq(pool: &PgPool, room_id: Uuid) -> Result<i64, StoreError> {
    let max = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT MAX(seq) FROM chat_messages WHERE room_id = $1",
    )
    .bind(room_id)
    .fetch_one(pool)
    .instrument(info_span!("chat.store.max_seq", room_id = %room_id))
    .await?;

    Ok(max.unwrap_or(0))
}
