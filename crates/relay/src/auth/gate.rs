//! Room authorization: who may enter a workshop room, and who may mutate which message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;
use workshop_chat_common::types::{ChatMessage, RoomRole};

use crate::error::ChatError;

/// External enrollment and ownership data. Rooms are keyed by workshop id.
#[derive(Clone)]
pub enum EnrollmentSource {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<(Uuid, Uuid), RoomRole>>>),
}

/// An owner who is also enrolled resolves to `owner`.
const ROOM_ROLE_QUERY: &str = r#"
    SELECT standing.role
    FROM (
        SELECT 'owner' AS role, 0 AS precedence
        FROM workshops AS w
        WHERE w.id = $1
          AND w.owner_id = $2
        UNION ALL
        SELECT 'member' AS role, 1 AS precedence
        FROM enrollments AS e
        WHERE e.workshop_id = $1
          AND e.user_id = $2
          AND e.status = 'active'
    ) AS standing
    ORDER BY standing.precedence
    LIMIT 1
"#;

impl EnrollmentSource {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    pub async fn role_for_user(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> anyhow::Result<Option<RoomRole>> {
        match self {
            Self::Postgres(pool) => {
                let role = sqlx::query_scalar::<_, String>(ROOM_ROLE_QUERY)
                    .bind(room_id)
                    .bind(user_id)
                    .fetch_optional(pool)
                    .instrument(info_span!("chat.db.query", query = "room_role_for_user"))
                    .await
                    .context("failed to query room role")?
                    .map(|role| {
                        RoomRole::from_db_value(&role).ok_or_else(|| {
                            anyhow::anyhow!("invalid room role '{role}' in database")
                        })
                    })
                    .transpose()?;

                Ok(role)
            }
            Self::Memory(store) => Ok(store.read().await.get(&(room_id, user_id)).copied()),
        }
    }

    /// Grants or revokes a role in the in-memory source. No-op for Postgres.
    pub async fn set_role(&self, room_id: Uuid, user_id: Uuid, role: Option<RoomRole>) {
        if let Self::Memory(store) = self {
            let mut store = store.write().await;
            match role {
                Some(role) => store.insert((room_id, user_id), role),
                None => store.remove(&(room_id, user_id)),
            };
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedRole {
    role: Option<RoomRole>,
    cached_at: Instant,
}

/// Answers "may this user be in this room" with a short-lived cache. A
/// revoked enrollment is honored at most `cache_ttl` late.
#[derive(Clone)]
pub struct AuthorizationGate {
    source: EnrollmentSource,
    cache: Arc<RwLock<HashMap<(Uuid, Uuid), CachedRole>>>,
    cache_ttl: Duration,
}

impl AuthorizationGate {
    pub fn new(source: EnrollmentSource, cache_ttl: Duration) -> Self {
        Self { source, cache: Arc::new(RwLock::new(HashMap::new())), cache_ttl }
    }

    pub fn source(&self) -> &EnrollmentSource {
        &self.source
    }

    /// `Ok(None)` means the user has no standing in the room.
    pub async fn authorize(
        &self,
        user_id: Uuid,
        room_id: Uuid,
    ) -> Result<Option<RoomRole>, ChatError> {
        let key = (room_id, user_id);
        if let Some(cached) = self.cache.read().await.get(&key).copied() {
            if cached.cached_at.elapsed() < self.cache_ttl {
                return Ok(cached.role);
            }
        }

        let role = self.source.role_for_user(room_id, user_id).await.map_err(|error| {
            warn!(error = %error, room_id = %room_id, user_id = %user_id, "authorization lookup failed");
            ChatError::StoreUnavailable(error.to_string())
        })?;

        let mut cache = self.cache.write().await;
        cache.retain(|_, entry| entry.cached_at.elapsed() < self.cache_ttl);
        cache.insert(key, CachedRole { role, cached_at: Instant::now() });

        Ok(role)
    }

    /// Like [`authorize`](Self::authorize) but turns "no standing" into `Forbidden`.
    pub async fn require_role(&self, user_id: Uuid, room_id: Uuid) -> Result<RoomRole, ChatError> {
        self.authorize(user_id, room_id)
            .await?
            .ok_or_else(|| ChatError::Forbidden(format!("not enrolled in room {room_id}")))
    }
}

/// Loads the target of an edit or delete: it must exist in `room_id` and not
/// be tombstoned.
pub fn live_message_in_room(
    message: Option<ChatMessage>,
    room_id: Uuid,
    message_id: Uuid,
) -> Result<ChatMessage, ChatError> {
    message
        .filter(|message| message.room_id == room_id && !message.is_deleted())
        .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))
}

/// Only the author may edit. Room ownership does not grant authorship.
pub fn check_can_edit(caller_id: Uuid, message: &ChatMessage) -> Result<(), ChatError> {
    if message.author_id == caller_id {
        Ok(())
    } else {
        Err(ChatError::Forbidden("only the author may edit a message".into()))
    }
}

pub fn check_can_delete(
    caller_id: Uuid,
    caller_role: RoomRole,
    message: &ChatMessage,
) -> Result<(), ChatError> {
    if message.author_id == caller_id || caller_role.can_moderate() {
        Ok(())
    } else {
        Err(ChatError::Forbidden("only the author or a room owner may delete a message".into()))
    }
}
