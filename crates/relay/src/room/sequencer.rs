//! Per-room `seq` allocation and the durable write pipeline.
//!
//! Each live room owns one [`RoomWriter`] task. It is the only place that
//! allocates `seq` for the room and it runs mutations one at a time in
//! arrival order, so two sends can never share a slot. A slot is reserved
//! before the durable write and committed only after it succeeds; failed,
//! timed-out and abandoned writes leave the counter untouched.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;
use workshop_chat_common::types::{ChatMessage, RoomRole};

use super::command::{Committed, RoomCommand, WriteOp, WriteOutcome};
use crate::auth::gate::{check_can_delete, check_can_edit, live_message_in_room};
use crate::error::ChatError;
use crate::store::{MessageStore, StoreError};
use crate::validation::validate_body;

pub const WRITE_QUEUE_CAPACITY: usize = 256;

/// Client nonces remembered per room for send idempotency.
pub const NONCE_WINDOW: usize = 1024;

/// The room's `seq` counter. Single owner, no interior locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomSequencer {
    head: i64,
}

impl RoomSequencer {
    pub fn new(head: i64) -> Self {
        Self { head: head.max(0) }
    }

    pub fn head(&self) -> i64 {
        self.head
    }

    /// The slot the next successful append will occupy.
    pub fn reserve(&self) -> i64 {
        self.head + 1
    }

    pub fn commit(&mut self, seq: i64) {
        self.head = self.head.max(seq);
    }

    /// Adopts the store's head if it is ahead. Never moves backwards.
    pub fn resync(&mut self, store_head: i64) -> bool {
        if store_head > self.head {
            self.head = store_head;
            true
        } else {
            false
        }
    }
}

/// Bounded memory of `(author, nonce) -> persisted message`, oldest evicted first.
#[derive(Debug)]
pub struct NonceWindow {
    capacity: usize,
    order: VecDeque<(Uuid, String)>,
    entries: HashMap<(Uuid, String), ChatMessage>,
}

impl NonceWindow {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), order: VecDeque::new(), entries: HashMap::new() }
    }

    pub fn get(&self, author_id: Uuid, nonce: &str) -> Option<&ChatMessage> {
        self.entries.get(&(author_id, nonce.to_string()))
    }

    pub fn remember(&mut self, author_id: Uuid, nonce: String, message: ChatMessage) {
        let key = (author_id, nonce);
        if self.entries.insert(key.clone(), message).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) struct RoomWriter {
    room_id: Uuid,
    store: MessageStore,
    sequencer: RoomSequencer,
    nonces: NonceWindow,
    needs_resync: bool,
    results: mpsc::Sender<RoomCommand>,
}

impl RoomWriter {
    /// Starts the writer for a room whose persisted head is `head`.
    pub(crate) fn spawn(
        room_id: Uuid,
        store: MessageStore,
        head: i64,
        results: mpsc::Sender<RoomCommand>,
    ) -> mpsc::Sender<WriteOp> {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let writer = Self {
            room_id,
            store,
            sequencer: RoomSequencer::new(head),
            nonces: NonceWindow::new(NONCE_WINDOW),
            needs_resync: false,
            results,
        };
        tokio::spawn(writer.run(rx).instrument(info_span!("chat.room.writer", room_id = %room_id)));
        tx
    }

    async fn run(mut self, mut ops: mpsc::Receiver<WriteOp>) {
        while let Some(op) = ops.recv().await {
            let outcome = self.process(op).await;
            if self.results.send(RoomCommand::WriteFinished(outcome)).await.is_err() {
                break;
            }
        }
    }

    async fn process(&mut self, op: WriteOp) -> WriteOutcome {
        let deadline = op.deadline();
        if op.is_abandoned() || Instant::now() >= deadline {
            return WriteOutcome {
                result: Err(ChatError::Timeout("queued write")),
                reply_tx: op.into_reply_tx(),
                resynced_head: None,
            };
        }

        let mut resynced_head = None;
        let (result, reply_tx) = match op {
            WriteOp::Append { message, client_nonce, reply_tx, .. } => (
                self.append(message, client_nonce, deadline, &mut resynced_head).await,
                reply_tx,
            ),
            WriteOp::Update { caller_id, message_id, body, reply_tx, .. } => {
                (self.update(caller_id, message_id, body, deadline).await, reply_tx)
            }
            WriteOp::Tombstone { caller_id, caller_role, message_id, reply_tx, .. } => {
                (self.tombstone(caller_id, caller_role, message_id, deadline).await, reply_tx)
            }
        };

        if matches!(
            result,
            Err(ChatError::StoreUnavailable(_) | ChatError::Timeout(_) | ChatError::Internal(_))
        ) {
            self.needs_resync = true;
        }

        WriteOutcome { result, reply_tx, resynced_head }
    }

    async fn append(
        &mut self,
        mut message: ChatMessage,
        client_nonce: Option<String>,
        deadline: Instant,
        resynced_head: &mut Option<i64>,
    ) -> Result<Committed, ChatError> {
        if let Some(nonce) = client_nonce.as_deref() {
            if let Some(existing) = self.nonces.get(message.author_id, nonce) {
                return Ok(Committed::Created {
                    message: existing.clone(),
                    client_nonce,
                    duplicate: true,
                });
            }
        }

        self.resync_if_needed(deadline, resynced_head).await?;

        let mut retried = false;
        loop {
            message.seq = self.sequencer.reserve();
            let attempt = timeout_at(deadline, self.store.append(&message))
                .instrument(info_span!("chat.sequencer.append", room_id = %self.room_id, seq = message.seq))
                .await;

            match attempt {
                Ok(Ok(seq)) => {
                    self.sequencer.commit(seq);
                    if let Some(nonce) = client_nonce.clone() {
                        self.nonces.remember(message.author_id, nonce, message.clone());
                    }
                    return Ok(Committed::Created { message, client_nonce, duplicate: false });
                }
                Ok(Err(StoreError::SeqConflict { seq, .. })) if !retried => {
                    warn!(room_id = %self.room_id, seq, "seq slot already taken, resyncing head");
                    retried = true;
                    self.needs_resync = true;
                    self.resync_if_needed(deadline, resynced_head).await?;
                }
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => return Err(ChatError::Timeout("send_message")),
            }
        }
    }

    async fn update(
        &mut self,
        caller_id: Uuid,
        message_id: Uuid,
        body: String,
        deadline: Instant,
    ) -> Result<Committed, ChatError> {
        let current = self.load_live(message_id, deadline, "edit_message").await?;
        check_can_edit(caller_id, &current)?;
        validate_body(&body, current.kind)?;

        let message = timeout_at(deadline, self.store.update(message_id, &body, Utc::now()))
            .await
            .map_err(|_| ChatError::Timeout("edit_message"))??;
        Ok(Committed::Edited { message })
    }

    async fn tombstone(
        &mut self,
        caller_id: Uuid,
        caller_role: RoomRole,
        message_id: Uuid,
        deadline: Instant,
    ) -> Result<Committed, ChatError> {
        let current = self.load_live(message_id, deadline, "delete_message").await?;
        check_can_delete(caller_id, caller_role, &current)?;

        let message = timeout_at(deadline, self.store.tombstone(message_id, Utc::now()))
            .await
            .map_err(|_| ChatError::Timeout("delete_message"))??;
        Ok(Committed::Deleted { message })
    }

    async fn load_live(
        &self,
        message_id: Uuid,
        deadline: Instant,
        action: &'static str,
    ) -> Result<ChatMessage, ChatError> {
        let message = timeout_at(deadline, self.store.get(message_id))
            .await
            .map_err(|_| ChatError::Timeout(action))??;
        live_message_in_room(message, self.room_id, message_id)
    }

    async fn resync_if_needed(
        &mut self,
        deadline: Instant,
        resynced_head: &mut Option<i64>,
    ) -> Result<(), ChatError> {
        if !self.needs_resync {
            return Ok(());
        }

        let store_head = timeout_at(deadline, self.store.max_seq(self.room_id))
            .instrument(info_span!("chat.sequencer.resync", room_id = %self.room_id))
            .await
            .map_err(|_| ChatError::Timeout("send_message"))??;

        let local_head = self.sequencer.head();
        if self.sequencer.resync(store_head) {
            warn!(
                room_id = %self.room_id,
                local_head,
                store_head,
                "store head moved past the writer, adopting it"
            );
            *resynced_head = Some(store_head);
        }
        self.needs_resync = false;
        Ok(())
    }
}
