//! The sequential owner of one live room.
//!
//! Every admit, removal, mutation and typing signal for a room goes through
//! this task's mailbox, so membership, the typing set and fan-out order are
//! never observed half-updated. Durable writes run on the room's writer task;
//! their results come back through the same mailbox before being fanned out.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use workshop_chat_common::protocol::ws::WsMessage;
use workshop_chat_common::types::{ChatMessage, PresenceUser};

use super::broker::RoomBroker;
use super::command::{
    Admission, Committed, Member, PresenceSnapshot, ReplyTx, RoomCommand, WriteOp, WriteOutcome,
    WriteReceipt,
};
use super::registry::{RegistryInner, RoomRegistry, RoomSettings};
use super::sequencer::RoomWriter;
use super::typing::TypingCoordinator;
use crate::error::ChatError;
use crate::metrics;
use crate::store::MessageStore;
use crate::validation::ValidatedSend;

pub const ROOM_MAILBOX_CAPACITY: usize = 1024;

/// Back-off before retrying an eviction that lost the race for the registry lock.
const EVICTION_RETRY: Duration = Duration::from_millis(25);

pub(crate) struct RoomActor {
    room_id: Uuid,
    generation: u64,
    store: MessageStore,
    settings: RoomSettings,
    registry: Weak<RegistryInner>,
    mailbox: mpsc::WeakSender<RoomCommand>,
    members: HashMap<Uuid, Member>,
    broker: RoomBroker,
    typing: TypingCoordinator,
    head_seq: i64,
    hydrated: bool,
    recent: VecDeque<ChatMessage>,
    recent_stale: bool,
    writer: Option<mpsc::Sender<WriteOp>>,
    pending_writes: usize,
    evict_at: Option<Instant>,
}

impl RoomActor {
    pub(crate) fn spawn(
        room_id: Uuid,
        generation: u64,
        store: MessageStore,
        settings: RoomSettings,
        registry: Weak<RegistryInner>,
    ) -> (mpsc::Sender<RoomCommand>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(ROOM_MAILBOX_CAPACITY);
        let actor = Self {
            room_id,
            generation,
            store,
            typing: TypingCoordinator::new(settings.typing_ttl),
            evict_at: Some(Instant::now() + settings.room_grace),
            settings,
            registry,
            mailbox: tx.downgrade(),
            members: HashMap::new(),
            broker: RoomBroker::new(room_id),
            head_seq: 0,
            hydrated: false,
            recent: VecDeque::new(),
            recent_stale: false,
            writer: None,
            pending_writes: 0,
        };
        let handle = tokio::spawn(
            actor
                .run(rx)
                .instrument(info_span!("chat.room", room_id = %room_id, generation)),
        );
        (tx, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        debug!("room actor started");
        loop {
            let wake = self.next_wake();
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = sleep_until_or_pending(wake) => {
                    let now = Instant::now();
                    if self.typing.expire_at(now) {
                        self.publish_typing();
                    }
                    if self.is_evictable(now) && self.try_evict(&mut rx, now) {
                        break;
                    }
                }
            }
        }
        debug!("room actor stopped");
    }

    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Admit { member, outbound, reply_tx } => {
                let result = self.admit(member, outbound).await;
                let _ = reply_tx.send(result);
            }
            RoomCommand::Remove { connection_id, reply_tx } => {
                let removed = self.remove_member(connection_id);
                if let Some(reply_tx) = reply_tx {
                    let _ = reply_tx.send(removed);
                }
            }
            RoomCommand::Presence { reply_tx } => {
                let _ = reply_tx.send(self.presence_snapshot());
            }
            RoomCommand::NextSeq { reply_tx } => {
                let result = match self.ensure_hydrated().await {
                    Ok(()) => Ok(self.head_seq + 1),
                    Err(error) => Err(error),
                };
                let _ = reply_tx.send(result);
            }
            RoomCommand::Send { connection_id, message, deadline, reply_tx } => {
                self.queue_send(connection_id, message, deadline, reply_tx);
            }
            RoomCommand::Edit { connection_id, message_id, body, deadline, reply_tx } => {
                let Some(member) = self.members.get(&connection_id) else {
                    let _ = reply_tx.send(Err(ChatError::NotJoined { room_id: self.room_id }));
                    return;
                };
                let op = WriteOp::Update {
                    caller_id: member.user_id,
                    message_id,
                    body,
                    deadline,
                    reply_tx,
                };
                self.enqueue(op);
            }
            RoomCommand::Delete { connection_id, caller_role, message_id, deadline, reply_tx } => {
                let Some(member) = self.members.get(&connection_id) else {
                    let _ = reply_tx.send(Err(ChatError::NotJoined { room_id: self.room_id }));
                    return;
                };
                let op = WriteOp::Tombstone {
                    caller_id: member.user_id,
                    caller_role,
                    message_id,
                    deadline,
                    reply_tx,
                };
                self.enqueue(op);
            }
            RoomCommand::Typing { connection_id, is_typing } => {
                self.set_typing(connection_id, is_typing);
            }
            RoomCommand::WriteFinished(outcome) => self.finish_write(outcome),
            #[cfg(test)]
            RoomCommand::Crash => panic!("room actor crash requested by test"),
        }
    }

    async fn admit(
        &mut self,
        member: Member,
        outbound: mpsc::Sender<WsMessage>,
    ) -> Result<Admission, ChatError> {
        self.ensure_hydrated().await?;
        if self.recent_stale {
            self.reload_recent().await?;
        }

        let connection_id = member.connection_id;
        debug!(connection_id = %connection_id, user_id = %member.user_id, "admitting member");
        self.members.insert(connection_id, member);
        self.broker.subscribe(connection_id, outbound);
        self.evict_at = None;

        let presence = self.presence_snapshot();
        let event = self.presence_event();
        self.publish(&event, Some(connection_id));

        Ok(Admission {
            head_seq: self.head_seq,
            presence: presence.count,
            recent_messages: self.recent.iter().cloned().map(ChatMessage::elided).collect(),
        })
    }

    fn remove_member(&mut self, connection_id: Uuid) -> bool {
        if !self.detach(connection_id).0 {
            return false;
        }
        self.announce_departure(true);
        true
    }

    /// Drops a connection from every per-room structure without publishing.
    /// Returns `(was_member, typing_changed)`.
    fn detach(&mut self, connection_id: Uuid) -> (bool, bool) {
        self.broker.unsubscribe(connection_id);
        if self.members.remove(&connection_id).is_none() {
            return (false, false);
        }
        (true, self.typing.clear_connection(connection_id))
    }

    fn announce_departure(&mut self, typing_changed: bool) {
        let event = self.presence_event();
        self.publish(&event, None);
        if typing_changed {
            self.publish_typing();
        }
        self.mark_idle_if_empty();
    }

    fn queue_send(
        &mut self,
        connection_id: Uuid,
        message: ValidatedSend,
        deadline: Instant,
        reply_tx: ReplyTx<WriteReceipt>,
    ) {
        let Some(member) = self.members.get(&connection_id) else {
            let _ = reply_tx.send(Err(ChatError::NotJoined { room_id: self.room_id }));
            return;
        };

        let draft = ChatMessage {
            id: Uuid::new_v4(),
            room_id: self.room_id,
            author_id: member.user_id,
            author_name: member.display_name.clone(),
            body: message.body,
            kind: message.kind,
            attachment_ref: message.attachment_ref,
            seq: 0,
            created_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
        };
        self.enqueue(WriteOp::Append {
            message: draft,
            client_nonce: message.client_nonce,
            deadline,
            reply_tx,
        });
    }

    fn enqueue(&mut self, op: WriteOp) {
        let Some(writer) = &self.writer else {
            let _ = op
                .into_reply_tx()
                .send(Err(ChatError::StoreUnavailable("room writer is not running".into())));
            return;
        };

        match writer.try_send(op) {
            Ok(()) => self.pending_writes += 1,
            Err(TrySendError::Full(op)) => {
                warn!(room_id = %self.room_id, "room write queue full, rejecting mutation");
                let _ = op
                    .into_reply_tx()
                    .send(Err(ChatError::StoreUnavailable("room write queue is full".into())));
            }
            Err(TrySendError::Closed(op)) => {
                warn!(room_id = %self.room_id, "room writer stopped, rejecting mutation");
                self.writer = None;
                let _ = op
                    .into_reply_tx()
                    .send(Err(ChatError::StoreUnavailable("room writer is not running".into())));
            }
        }
    }

    fn set_typing(&mut self, connection_id: Uuid, is_typing: bool) {
        let Some(member) = self.members.get(&connection_id) else {
            return;
        };
        let changed = if is_typing {
            self.typing.start(member.user_id, &member.display_name, connection_id)
        } else {
            self.typing.stop(member.user_id)
        };
        if changed {
            self.publish_typing();
        }
    }

    fn finish_write(&mut self, outcome: WriteOutcome) {
        self.pending_writes = self.pending_writes.saturating_sub(1);
        let WriteOutcome { result, reply_tx, resynced_head } = outcome;
        if resynced_head.is_some() {
            self.recent_stale = true;
        }

        let reply = match result {
            Ok(Committed::Created { message, client_nonce, duplicate }) => {
                if !duplicate {
                    self.fan_out_created(&message, client_nonce);
                }
                Ok(WriteReceipt { message, duplicate })
            }
            Ok(Committed::Edited { message }) => {
                self.replace_cached(&message);
                let event = WsMessage::MessageEdited {
                    room_id: self.room_id,
                    seq: message.seq,
                    message: message.clone(),
                };
                self.publish(&event, None);
                Ok(WriteReceipt { message, duplicate: false })
            }
            Ok(Committed::Deleted { message }) => {
                self.replace_cached(&message);
                let event = WsMessage::MessageDeleted {
                    room_id: self.room_id,
                    seq: message.seq,
                    message_id: message.id,
                    deleted_at: message.deleted_at.map(|at| at.to_rfc3339()).unwrap_or_default(),
                };
                self.publish(&event, None);
                Ok(WriteReceipt { message: message.elided(), duplicate: false })
            }
            Err(error) => Err(error),
        };

        let _ = reply_tx.send(reply);
        self.mark_idle_if_empty();
    }

    fn fan_out_created(&mut self, message: &ChatMessage, client_nonce: Option<String>) {
        let expected = self.head_seq + 1;
        if message.seq != expected {
            metrics::increment_sequence_gap_count();
            warn!(
                room_id = %self.room_id,
                expected,
                seq = message.seq,
                "room sequence skipped slots"
            );
        }
        self.head_seq = self.head_seq.max(message.seq);

        self.recent.push_back(message.clone());
        while self.recent.len() > self.settings.history_page_size {
            self.recent.pop_front();
        }

        let event = WsMessage::MessageCreated {
            room_id: self.room_id,
            seq: message.seq,
            message: message.clone(),
            client_nonce,
        };
        self.publish(&event, None);

        if self.typing.stop(message.author_id) {
            self.publish_typing();
        }
    }

    fn replace_cached(&mut self, message: &ChatMessage) {
        if let Some(cached) = self.recent.iter_mut().find(|cached| cached.id == message.id) {
            *cached = message.clone();
        }
    }

    /// Publishes to members, pruning any whose connection has gone away.
    fn publish(&mut self, event: &WsMessage, excluded: Option<Uuid>) {
        let mut closed = self.broker.publish_except(event, excluded).closed;
        while !closed.is_empty() {
            let mut typing_changed = false;
            for connection_id in closed.drain(..) {
                debug!(connection_id = %connection_id, "pruning closed member");
                typing_changed |= self.detach(connection_id).1;
            }
            closed = self.broker.publish(&self.presence_event()).closed;
            if typing_changed {
                closed.extend(self.broker.publish(&self.typing_event()).closed);
            }
        }
        self.mark_idle_if_empty();
    }

    fn publish_typing(&mut self) {
        let event = self.typing_event();
        self.publish(&event, None);
    }

    fn presence_snapshot(&self) -> PresenceSnapshot {
        let distinct: BTreeMap<Uuid, &str> = self
            .members
            .values()
            .map(|member| (member.user_id, member.display_name.as_str()))
            .collect();
        let mut users: Vec<PresenceUser> = distinct
            .into_iter()
            .map(|(user_id, display_name)| PresenceUser {
                user_id,
                display_name: display_name.to_string(),
            })
            .collect();
        users.sort_by(|a, b| {
            a.display_name.cmp(&b.display_name).then_with(|| a.user_id.cmp(&b.user_id))
        });
        PresenceSnapshot { count: users.len(), users }
    }

    fn presence_event(&self) -> WsMessage {
        let snapshot = self.presence_snapshot();
        WsMessage::PresenceChanged {
            room_id: self.room_id,
            count: snapshot.count,
            users: snapshot.users,
            ephemeral: true,
        }
    }

    fn typing_event(&self) -> WsMessage {
        WsMessage::TypingChanged {
            room_id: self.room_id,
            typing: self.typing.snapshot(),
            ephemeral: true,
        }
    }

    async fn ensure_hydrated(&mut self) -> Result<(), ChatError> {
        if self.hydrated {
            return Ok(());
        }

        let head = self.with_store_timeout(self.store.max_seq(self.room_id)).await?;
        let recent = self
            .with_store_timeout(self.store.list_recent(self.room_id, self.settings.history_page_size))
            .await?;

        self.head_seq = head;
        self.recent = recent.into();
        self.recent_stale = false;

        let Some(results) = self.mailbox.upgrade() else {
            return Err(ChatError::RoomReset { room_id: self.room_id });
        };
        self.writer = Some(RoomWriter::spawn(self.room_id, self.store.clone(), head, results));
        self.hydrated = true;
        debug!(head_seq = head, cached = self.recent.len(), "room hydrated");
        Ok(())
    }

    async fn reload_recent(&mut self) -> Result<(), ChatError> {
        let recent = self
            .with_store_timeout(self.store.list_recent(self.room_id, self.settings.history_page_size))
            .await?;
        if let Some(last) = recent.last() {
            self.head_seq = self.head_seq.max(last.seq);
        }
        self.recent = recent.into();
        self.recent_stale = false;
        Ok(())
    }

    async fn with_store_timeout<T, F>(&self, future: F) -> Result<T, ChatError>
    where
        F: std::future::Future<Output = Result<T, crate::store::StoreError>>,
    {
        match timeout(self.settings.store_timeout, future).await {
            Ok(result) => result.map_err(|error| {
                warn!(room_id = %self.room_id, error = %error, "room hydration failed");
                ChatError::from(error)
            }),
            Err(_) => Err(ChatError::Timeout("room hydration")),
        }
    }

    fn mark_idle_if_empty(&mut self) {
        if self.members.is_empty() && self.evict_at.is_none() {
            self.evict_at = Some(Instant::now() + self.settings.room_grace);
        }
    }

    fn is_evictable(&self, now: Instant) -> bool {
        self.members.is_empty()
            && self.pending_writes == 0
            && self.evict_at.is_some_and(|at| at <= now)
    }

    fn next_wake(&self) -> Option<Instant> {
        let eviction = if self.pending_writes == 0 { self.evict_at } else { None };
        match (self.typing.next_expiry(), eviction) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Removes this room from the registry. Returns false when the room must
    /// stay up for now; the caller keeps looping.
    fn try_evict(&mut self, rx: &mut mpsc::Receiver<RoomCommand>, now: Instant) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return true;
        };

        let leftovers = {
            let Ok(mut rooms) = registry.rooms.try_write() else {
                self.evict_at = Some(now + EVICTION_RETRY);
                return false;
            };
            if !rx.is_empty() {
                return false;
            }
            if rooms.get(&self.room_id).is_some_and(|handle| handle.generation == self.generation) {
                rooms.remove(&self.room_id);
            }
            rx.close();
            let mut leftovers = Vec::new();
            while let Ok(command) = rx.try_recv() {
                leftovers.push(command);
            }
            leftovers
        };

        metrics::room_evicted();
        info!(room_id = %self.room_id, head_seq = self.head_seq, "evicted idle room");

        if !leftovers.is_empty() {
            let registry = RoomRegistry::from_inner(Arc::clone(&registry));
            let room_id = self.room_id;
            tokio::spawn(async move {
                for command in leftovers {
                    registry.redispatch(room_id, command).await;
                }
            });
        }
        true
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
