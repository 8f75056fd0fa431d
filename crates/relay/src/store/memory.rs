use std::collections::{BTreeMap, HashMap};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;
use workshop_chat_common::types::ChatMessage;

use super::StoreError;

#[derive(Debug, Default)]
struct MemoryState {
    messages: HashMap<Uuid, ChatMessage>,
    rooms: HashMap<Uuid, BTreeMap<i64, Uuid>>,
}

/// In-process store used when no database is configured and by tests.
///
/// `set_unavailable` and `set_write_delay` simulate an outage and a slow
/// backend. A delayed write only lands once the delay has elapsed, so a write
/// abandoned mid-delay leaves no trace.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageStore {
    state: Arc<RwLock<MemoryState>>,
    unavailable: Arc<AtomicBool>,
    write_delay_ms: Arc<AtomicU64>,
}

impl MemoryMessageStore {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.write_delay_ms.store(millis, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    async fn before_write(&self) -> Result<(), StoreError> {
        self.check_available()?;
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.check_available()?;
        }
        Ok(())
    }

    pub(super) async fn append(&self, message: &ChatMessage) -> Result<i64, StoreError> {
        self.before_write().await?;
        let mut state = self.state.write().await;
        let room = state.rooms.entry(message.room_id).or_default();
        if room.contains_key(&message.seq) {
            return Err(StoreError::SeqConflict { room_id: message.room_id, seq: message.seq });
        }
        room.insert(message.seq, message.id);
        state.messages.insert(message.id, message.clone());
        Ok(message.seq)
    }

    pub(super) async fn update(
        &self,
        message_id: Uuid,
        body: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<ChatMessage, StoreError> {
        self.before_write().await?;
        let mut state = self.state.write().await;
        let message = state
            .messages
            .get_mut(&message_id)
            .filter(|message| !message.is_deleted())
            .ok_or(StoreError::NotFound { message_id })?;
        message.body = body.to_string();
        message.edited_at = Some(edited_at);
        Ok(message.clone())
    }

    pub(super) async fn tombstone(
        &self,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> Result<ChatMessage, StoreError> {
        self.before_write().await?;
        let mut state = self.state.write().await;
        let message = state
            .messages
            .get_mut(&message_id)
            .filter(|message| !message.is_deleted())
            .ok_or(StoreError::NotFound { message_id })?;
        message.deleted_at = Some(deleted_at);
        Ok(message.clone())
    }

    pub(super) async fn get(&self, message_id: Uuid) -> Result<Option<ChatMessage>, StoreError> {
        self.check_available()?;
        Ok(self.state.read().await.messages.get(&message_id).cloned())
    }

    pub(super) async fn list_before(
        &self,
        room_id: Uuid,
        before_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        let Some(room) = state.rooms.get(&room_id) else {
            return Ok(Vec::new());
        };

        let upper = before_seq.unwrap_or(i64::MAX);
        let mut page: Vec<ChatMessage> = room
            .range(..upper)
            .rev()
            .take(limit)
            .filter_map(|(_, id)| state.messages.get(id).cloned())
            .collect();
        page.reverse();
        Ok(page)
    }

    pub(super) async fn max_seq(&self, room_id: Uuid) -> Result<i64, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .rooms
            .get(&room_id)
            .and_then(|room| room.keys().next_back().copied())
            .unwrap_or(0))
    }
}
