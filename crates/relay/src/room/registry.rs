//! Directory of live rooms.
//!
//! The registry maps a room id to the mailbox of its actor, spawning actors on
//! demand when a connection is admitted. Only the map itself is behind a lock,
//! and it is never held across a send: callers clone the mailbox handle, drop
//! the lock, then talk to the actor. A room that went away between the two
//! steps (evicted or crashed) is detected by the failed send and respawned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendError};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;
use workshop_chat_common::protocol::ws::WsMessage;
use workshop_chat_common::types::RoomRole;

use super::actor::RoomActor;
use super::command::{Admission, Member, PresenceSnapshot, RoomCommand, WriteReceipt};
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::metrics;
use crate::store::MessageStore;
use crate::validation::ValidatedSend;

const MAX_DISPATCH_ATTEMPTS: usize = 3;

/// Per-room tuning handed to each actor at spawn.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub typing_ttl: Duration,
    pub room_grace: Duration,
    pub history_page_size: usize,
    /// Bound on store reads done inline by the actor (hydration, cache reload).
    pub store_timeout: Duration,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self::from(&ChatConfig::default())
    }
}

impl From<&ChatConfig> for RoomSettings {
    fn from(config: &ChatConfig) -> Self {
        Self {
            typing_ttl: config.typing_ttl,
            room_grace: config.room_grace,
            history_page_size: config.history_page_size,
            store_timeout: config.action_timeout,
        }
    }
}

#[derive(Clone)]
pub(crate) struct RoomHandle {
    pub(crate) sender: mpsc::Sender<RoomCommand>,
    pub(crate) generation: u64,
}

pub(crate) struct RegistryInner {
    pub(crate) rooms: RwLock<HashMap<Uuid, RoomHandle>>,
    store: MessageStore,
    settings: RoomSettings,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

impl RoomRegistry {
    pub fn new(store: MessageStore, settings: RoomSettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: RwLock::new(HashMap::new()),
                store,
                settings,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    pub fn store(&self) -> &MessageStore {
        &self.inner.store
    }

    /// Admits a connection, spawning the room if it is not live. Room events
    /// for the member are pushed to `outbound` from the moment this returns.
    pub async fn admit(
        &self,
        room_id: Uuid,
        member: Member,
        outbound: mpsc::Sender<WsMessage>,
    ) -> Result<Admission, ChatError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(room_id, RoomCommand::Admit { member, outbound, reply_tx }).await?;
        reply_rx.await.map_err(|_| ChatError::RoomReset { room_id })?
    }

    /// Idempotent. Returns whether the connection was a member.
    pub async fn remove(&self, room_id: Uuid, connection_id: Uuid) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = RoomCommand::Remove { connection_id, reply_tx: Some(reply_tx) };
        if self.dispatch_existing(room_id, command).await.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub async fn presence(&self, room_id: Uuid) -> PresenceSnapshot {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.dispatch_existing(room_id, RoomCommand::Presence { reply_tx }).await.is_err() {
            return PresenceSnapshot::empty();
        }
        reply_rx.await.unwrap_or_else(|_| PresenceSnapshot::empty())
    }

    pub async fn presence_count(&self, room_id: Uuid) -> usize {
        self.presence(room_id).await.count
    }

    /// The `seq` the next created message in the room would receive. Rooms
    /// that are not live answer from the store without being spawned.
    pub async fn next_seq(&self, room_id: Uuid) -> Result<i64, ChatError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        match self.dispatch_existing(room_id, RoomCommand::NextSeq { reply_tx }).await {
            Ok(()) => reply_rx.await.map_err(|_| ChatError::RoomReset { room_id })?,
            Err(_) => Ok(self.inner.store.max_seq(room_id).await? + 1),
        }
    }

    pub async fn send_message(
        &self,
        room_id: Uuid,
        connection_id: Uuid,
        message: ValidatedSend,
        deadline: Instant,
    ) -> Result<WriteReceipt, ChatError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = RoomCommand::Send { connection_id, message, deadline, reply_tx };
        self.mutate(room_id, command, reply_rx).await
    }

    pub async fn edit_message(
        &self,
        room_id: Uuid,
        connection_id: Uuid,
        message_id: Uuid,
        body: String,
        deadline: Instant,
    ) -> Result<WriteReceipt, ChatError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = RoomCommand::Edit { connection_id, message_id, body, deadline, reply_tx };
        self.mutate(room_id, command, reply_rx).await
    }

    pub async fn delete_message(
        &self,
        room_id: Uuid,
        connection_id: Uuid,
        caller_role: RoomRole,
        message_id: Uuid,
        deadline: Instant,
    ) -> Result<WriteReceipt, ChatError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command =
            RoomCommand::Delete { connection_id, caller_role, message_id, deadline, reply_tx };
        self.mutate(room_id, command, reply_rx).await
    }

    /// Fire-and-forget; typing in a room that is not live is dropped.
    pub async fn set_typing(&self, room_id: Uuid, connection_id: Uuid, is_typing: bool) {
        let _ = self
            .dispatch_existing(room_id, RoomCommand::Typing { connection_id, is_typing })
            .await;
    }

    pub async fn live_rooms(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    pub async fn is_live(&self, room_id: Uuid) -> bool {
        self.inner.rooms.read().await.contains_key(&room_id)
    }

    #[cfg(test)]
    pub(crate) async fn crash(&self, room_id: Uuid) {
        let _ = self.dispatch_existing(room_id, RoomCommand::Crash).await;
    }

    async fn mutate(
        &self,
        room_id: Uuid,
        command: RoomCommand,
        reply_rx: oneshot::Receiver<Result<WriteReceipt, ChatError>>,
    ) -> Result<WriteReceipt, ChatError> {
        if self.dispatch_existing(room_id, command).await.is_err() {
            return Err(ChatError::NotJoined { room_id });
        }
        reply_rx.await.map_err(|_| ChatError::RoomReset { room_id })?
    }

    /// Hands back a command that an evicting room received too late.
    pub(crate) async fn redispatch(&self, room_id: Uuid, command: RoomCommand) {
        if let Err(error) = self.dispatch(room_id, command).await {
            debug!(room_id = %room_id, error = %error, "dropping command for reset room");
        }
    }

    async fn dispatch(&self, room_id: Uuid, command: RoomCommand) -> Result<(), ChatError> {
        let mut command = command;
        for _ in 0..MAX_DISPATCH_ATTEMPTS {
            let handle = self.handle_or_spawn(room_id).await;
            match handle.sender.send(command).await {
                Ok(()) => return Ok(()),
                Err(SendError(returned)) => {
                    command = returned;
                    self.forget(room_id, handle.generation).await;
                }
            }
        }
        error!(room_id = %room_id, "room kept closing its mailbox during dispatch");
        Err(ChatError::RoomReset { room_id })
    }

    async fn dispatch_existing(
        &self,
        room_id: Uuid,
        command: RoomCommand,
    ) -> Result<(), RoomCommand> {
        let handle = {
            let rooms = self.inner.rooms.read().await;
            match rooms.get(&room_id) {
                Some(handle) => handle.clone(),
                None => return Err(command),
            }
        };
        match handle.sender.send(command).await {
            Ok(()) => Ok(()),
            Err(SendError(returned)) => {
                self.forget(room_id, handle.generation).await;
                Err(returned)
            }
        }
    }

    async fn handle_or_spawn(&self, room_id: Uuid) -> RoomHandle {
        if let Some(handle) = self.inner.rooms.read().await.get(&room_id) {
            return handle.clone();
        }

        let mut rooms = self.inner.rooms.write().await;
        if let Some(handle) = rooms.get(&room_id) {
            return handle.clone();
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let (sender, task) = RoomActor::spawn(
            room_id,
            generation,
            self.inner.store.clone(),
            self.inner.settings.clone(),
            Arc::downgrade(&self.inner),
        );
        supervise(Arc::downgrade(&self.inner), room_id, generation, task);
        metrics::room_spawned();
        debug!(room_id = %room_id, generation, "spawned room");

        let handle = RoomHandle { sender, generation };
        rooms.insert(room_id, handle.clone());
        handle
    }

    /// Drops the registry entry only if it still points at `generation`.
    async fn forget(&self, room_id: Uuid, generation: u64) -> bool {
        forget_generation(&self.inner, room_id, generation).await
    }
}

async fn forget_generation(inner: &RegistryInner, room_id: Uuid, generation: u64) -> bool {
    let mut rooms = inner.rooms.write().await;
    if rooms.get(&room_id).is_some_and(|handle| handle.generation == generation) {
        rooms.remove(&room_id);
        true
    } else {
        false
    }
}

/// Watches a room task. A panicked room is unregistered so the next join
/// starts a fresh actor; its members see their event stream end.
fn supervise(registry: Weak<RegistryInner>, room_id: Uuid, generation: u64, task: JoinHandle<()>) {
    tokio::spawn(async move {
        let Err(join_error) = task.await else {
            return;
        };
        if !join_error.is_panic() {
            return;
        }
        metrics::room_crashed();
        error!(room_id = %room_id, generation, "room actor panicked, resetting room");
        if let Some(inner) = registry.upgrade() {
            forget_generation(&inner, room_id, generation).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio::time::{self, Duration};
    use workshop_chat_common::types::MessageKind;

    use super::*;
    use crate::room::broker::OUTBOUND_QUEUE_CAPACITY;
    use crate::store::MemoryMessageStore;
    use crate::validation::validate_send;

    fn settings() -> RoomSettings {
        RoomSettings {
            typing_ttl: Duration::from_secs(3),
            room_grace: Duration::from_secs(30),
            history_page_size: 50,
            store_timeout: Duration::from_secs(5),
        }
    }

    fn member(user_id: Uuid, name: &str, role: RoomRole) -> Member {
        Member {
            connection_id: Uuid::new_v4(),
            user_id,
            display_name: name.into(),
            role,
            joined_at: Utc::now(),
        }
    }

    fn text(body: &str) -> ValidatedSend {
        validate_send(body.into(), MessageKind::Text, None, None).expect("valid text")
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    struct Joined {
        member: Member,
        events: mpsc::Receiver<WsMessage>,
    }

    async fn join(registry: &RoomRegistry, room_id: Uuid, name: &str, role: RoomRole) -> Joined {
        let member = member(Uuid::new_v4(), name, role);
        let (tx, events) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        registry.admit(room_id, member.clone(), tx).await.expect("admit");
        Joined { member, events }
    }

    /// Lets spawned tasks run until the room settles.
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(events: &mut mpsc::Receiver<WsMessage>) -> Vec<WsMessage> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn sends_fan_out_to_every_member_in_seq_order() {
        let registry = RoomRegistry::new(MessageStore::memory(), settings());
        let room_id = Uuid::new_v4();
        let mut ada = join(&registry, room_id, "Ada", RoomRole::Member).await;
        let mut bob = join(&registry, room_id, "Bob", RoomRole::Owner).await;

        for body in ["one", "two", "three"] {
            registry
                .send_message(room_id, ada.member.connection_id, text(body), deadline())
                .await
                .expect("send");
        }

        for joined in [&mut ada, &mut bob] {
            let seqs: Vec<i64> = drain(&mut joined.events)
                .into_iter()
                .filter_map(|event| match event {
                    WsMessage::MessageCreated { seq, .. } => Some(seq),
                    _ => None,
                })
                .collect();
            assert_eq!(seqs, vec![1, 2, 3]);
        }
        assert_eq!(registry.next_seq(room_id).await.expect("next seq"), 4);
    }

    #[tokio::test]
    async fn joiner_receives_history_and_others_see_presence() {
        let registry = RoomRegistry::new(MessageStore::memory(), settings());
        let room_id = Uuid::new_v4();
        let mut ada = join(&registry, room_id, "Ada", RoomRole::Member).await;
        registry
            .send_message(room_id, ada.member.connection_id, text("hello"), deadline())
            .await
            .expect("send");
        drain(&mut ada.events);

        let bob = member(Uuid::new_v4(), "Bob", RoomRole::Member);
        let (tx, mut bob_events) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let admission = registry.admit(room_id, bob, tx).await.expect("admit");

        assert_eq!(admission.head_seq, 1);
        assert_eq!(admission.presence, 2);
        assert_eq!(admission.recent_messages.len(), 1);
        assert!(drain(&mut bob_events).is_empty());
        assert!(matches!(
            drain(&mut ada.events).as_slice(),
            [WsMessage::PresenceChanged { count: 2, .. }]
        ));
    }

    #[tokio::test]
    async fn removal_is_idempotent_and_announced_once() {
        let registry = RoomRegistry::new(MessageStore::memory(), settings());
        let room_id = Uuid::new_v4();
        let ada = join(&registry, room_id, "Ada", RoomRole::Member).await;
        let mut bob = join(&registry, room_id, "Bob", RoomRole::Member).await;
        drain(&mut bob.events);

        assert!(registry.remove(room_id, ada.member.connection_id).await);
        assert!(!registry.remove(room_id, ada.member.connection_id).await);
        assert!(!registry.remove(Uuid::new_v4(), ada.member.connection_id).await);

        assert!(matches!(
            drain(&mut bob.events).as_slice(),
            [WsMessage::PresenceChanged { count: 1, .. }]
        ));
        assert_eq!(registry.presence_count(room_id).await, 1);
    }

    #[tokio::test]
    async fn non_members_cannot_mutate() {
        let registry = RoomRegistry::new(MessageStore::memory(), settings());
        let room_id = Uuid::new_v4();
        let _ada = join(&registry, room_id, "Ada", RoomRole::Member).await;

        let stranger = Uuid::new_v4();
        let result = registry.send_message(room_id, stranger, text("hi"), deadline()).await;
        assert_eq!(result, Err(ChatError::NotJoined { room_id }));

        let other_room = Uuid::new_v4();
        let result = registry.send_message(other_room, stranger, text("hi"), deadline()).await;
        assert_eq!(result, Err(ChatError::NotJoined { room_id: other_room }));
        assert!(!registry.is_live(other_room).await);
    }

    #[tokio::test]
    async fn store_outage_fails_the_send_without_consuming_a_seq() {
        let store = MemoryMessageStore::default();
        let registry = RoomRegistry::new(MessageStore::Memory(store.clone()), settings());
        let room_id = Uuid::new_v4();
        let mut ada = join(&registry, room_id, "Ada", RoomRole::Member).await;

        store.set_unavailable(true);
        let failed =
            registry.send_message(room_id, ada.member.connection_id, text("lost"), deadline()).await;
        assert!(matches!(failed, Err(ChatError::StoreUnavailable(_))));
        assert!(drain(&mut ada.events).is_empty());

        store.set_unavailable(false);
        let receipt = registry
            .send_message(room_id, ada.member.connection_id, text("kept"), deadline())
            .await
            .expect("send");
        assert_eq!(receipt.message.seq, 1);
    }

    #[tokio::test]
    async fn typing_is_announced_on_change_only_and_cleared_by_send() {
        let registry = RoomRegistry::new(MessageStore::memory(), settings());
        let room_id = Uuid::new_v4();
        let ada = join(&registry, room_id, "Ada", RoomRole::Member).await;
        let mut bob = join(&registry, room_id, "Bob", RoomRole::Member).await;
        drain(&mut bob.events);

        registry.set_typing(room_id, ada.member.connection_id, true).await;
        registry.set_typing(room_id, ada.member.connection_id, true).await;
        registry
            .send_message(room_id, ada.member.connection_id, text("done"), deadline())
            .await
            .expect("send");

        let kinds: Vec<&str> = drain(&mut bob.events).iter().map(WsMessage::kind).collect();
        assert_eq!(kinds, vec!["typing_changed", "message_created", "typing_changed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_expires_after_ttl() {
        let registry = RoomRegistry::new(MessageStore::memory(), settings());
        let room_id = Uuid::new_v4();
        let ada = join(&registry, room_id, "Ada", RoomRole::Member).await;
        let mut bob = join(&registry, room_id, "Bob", RoomRole::Member).await;
        drain(&mut bob.events);

        registry.set_typing(room_id, ada.member.connection_id, true).await;
        settle().await;
        assert!(matches!(
            drain(&mut bob.events).as_slice(),
            [WsMessage::TypingChanged { typing, .. }] if typing.len() == 1
        ));

        time::sleep(Duration::from_millis(3_100)).await;
        settle().await;
        assert!(matches!(
            drain(&mut bob.events).as_slice(),
            [WsMessage::TypingChanged { typing, .. }] if typing.is_empty()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_room_is_evicted_after_grace_and_respawns_on_join() {
        let registry = RoomRegistry::new(MessageStore::memory(), settings());
        let room_id = Uuid::new_v4();
        let ada = join(&registry, room_id, "Ada", RoomRole::Member).await;
        registry
            .send_message(room_id, ada.member.connection_id, text("before"), deadline())
            .await
            .expect("send");
        registry.remove(room_id, ada.member.connection_id).await;

        time::sleep(Duration::from_secs(29)).await;
        settle().await;
        assert!(registry.is_live(room_id).await);

        time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(!registry.is_live(room_id).await);
        assert_eq!(registry.live_rooms().await, 0);
        assert_eq!(registry.next_seq(room_id).await.expect("next seq"), 2);

        let bob = member(Uuid::new_v4(), "Bob", RoomRole::Member);
        let (tx, _events) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let admission = registry.admit(room_id, bob.clone(), tx).await.expect("admit");
        assert_eq!(admission.head_seq, 1);
        let receipt = registry
            .send_message(room_id, bob.connection_id, text("after"), deadline())
            .await
            .expect("send");
        assert_eq!(receipt.message.seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_within_grace_keeps_the_room_alive() {
        let registry = RoomRegistry::new(MessageStore::memory(), settings());
        let room_id = Uuid::new_v4();
        let ada = join(&registry, room_id, "Ada", RoomRole::Member).await;
        registry.remove(room_id, ada.member.connection_id).await;

        time::sleep(Duration::from_secs(20)).await;
        let _bob = join(&registry, room_id, "Bob", RoomRole::Member).await;
        time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert!(registry.is_live(room_id).await);
    }

    #[tokio::test]
    async fn crashed_room_ends_member_streams_and_respawns() {
        let registry = RoomRegistry::new(MessageStore::memory(), settings());
        let room_id = Uuid::new_v4();
        let mut ada = join(&registry, room_id, "Ada", RoomRole::Member).await;
        registry
            .send_message(room_id, ada.member.connection_id, text("survives"), deadline())
            .await
            .expect("send");
        drain(&mut ada.events);

        registry.crash(room_id).await;
        assert!(ada.events.recv().await.is_none());
        for _ in 0..64 {
            if !registry.is_live(room_id).await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!registry.is_live(room_id).await);

        let rejoined = join(&registry, room_id, "Ada", RoomRole::Member).await;
        let receipt = registry
            .send_message(room_id, rejoined.member.connection_id, text("again"), deadline())
            .await
            .expect("send after reset");
        assert_eq!(receipt.message.seq, 2);
    }
}
