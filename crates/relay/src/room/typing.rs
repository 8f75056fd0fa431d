//! Per-room set of users currently typing, with TTL expiry.
//!
//! Every mutator reports whether the aggregate set (user id -> display name)
//! changed, so callers fan out `typing_changed` only on entry or exit, never
//! on a refresh.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;
use workshop_chat_common::types::TypingUser;

#[derive(Debug, Clone)]
struct TypingEntry {
    display_name: String,
    connection_id: Uuid,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct TypingCoordinator {
    ttl: Duration,
    entries: HashMap<Uuid, TypingEntry>,
}

impl TypingCoordinator {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: HashMap::new() }
    }

    pub fn start(&mut self, user_id: Uuid, display_name: &str, connection_id: Uuid) -> bool {
        self.start_at(user_id, display_name, connection_id, Instant::now())
    }

    pub fn start_at(
        &mut self,
        user_id: Uuid,
        display_name: &str,
        connection_id: Uuid,
        now: Instant,
    ) -> bool {
        let expires_at = now + self.ttl;
        match self.entries.get_mut(&user_id) {
            Some(entry) => {
                entry.expires_at = expires_at;
                entry.connection_id = connection_id;
                false
            }
            None => {
                self.entries.insert(
                    user_id,
                    TypingEntry { display_name: display_name.to_string(), connection_id, expires_at },
                );
                true
            }
        }
    }

    pub fn stop(&mut self, user_id: Uuid) -> bool {
        self.entries.remove(&user_id).is_some()
    }

    /// Drops the entry only if it was last refreshed from `connection_id`;
    /// another tab of the same user keeps typing.
    pub fn clear_connection(&mut self, connection_id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.connection_id != connection_id);
        self.entries.len() != before
    }

    pub fn expire_at(&mut self, now: Instant) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.entries.len() != before
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.expires_at).min()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Typing users ordered by display name, then id.
    pub fn snapshot(&self) -> Vec<TypingUser> {
        let mut typing: Vec<TypingUser> = self
            .entries
            .iter()
            .map(|(user_id, entry)| TypingUser {
                user_id: *user_id,
                display_name: entry.display_name.clone(),
            })
            .collect();
        typing.sort_by(|a, b| {
            a.display_name.cmp(&b.display_name).then_with(|| a.user_id.cmp(&b.user_id))
        });
        typing
    }
}
