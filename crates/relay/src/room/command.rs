//! Mailbox vocabulary of a room actor and its writer.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;
use workshop_chat_common::protocol::ws::WsMessage;
use workshop_chat_common::types::{ChatMessage, PresenceUser, RoomRole};

use crate::error::ChatError;
use crate::validation::ValidatedSend;

/// One admitted connection. A user with two tabs open is two members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub role: RoomRole,
    pub joined_at: DateTime<Utc>,
}

/// What a connection learns when it is admitted.
#[derive(Debug, Clone)]
pub struct Admission {
    /// Highest `seq` fanned out before this admission. Live events after it
    /// reach the new member through its outbound queue.
    pub head_seq: i64,
    pub presence: usize,
    /// Most recent page, ascending by `seq`, tombstones elided.
    pub recent_messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub count: usize,
    pub users: Vec<PresenceUser>,
}

impl PresenceSnapshot {
    pub fn empty() -> Self {
        Self { count: 0, users: Vec::new() }
    }
}

/// Result of a durable mutation. `duplicate` marks a send whose client nonce
/// had already been persisted; no new `seq` was consumed and nothing was fanned out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub message: ChatMessage,
    pub duplicate: bool,
}

pub type ReplyTx<T> = oneshot::Sender<Result<T, ChatError>>;

pub enum RoomCommand {
    Admit {
        member: Member,
        outbound: mpsc::Sender<WsMessage>,
        reply_tx: ReplyTx<Admission>,
    },
    Remove {
        connection_id: Uuid,
        reply_tx: Option<oneshot::Sender<bool>>,
    },
    Presence {
        reply_tx: oneshot::Sender<PresenceSnapshot>,
    },
    NextSeq {
        reply_tx: ReplyTx<i64>,
    },
    Send {
        connection_id: Uuid,
        message: ValidatedSend,
        deadline: Instant,
        reply_tx: ReplyTx<WriteReceipt>,
    },
    Edit {
        connection_id: Uuid,
        message_id: Uuid,
        body: String,
        deadline: Instant,
        reply_tx: ReplyTx<WriteReceipt>,
    },
    Delete {
        connection_id: Uuid,
        caller_role: RoomRole,
        message_id: Uuid,
        deadline: Instant,
        reply_tx: ReplyTx<WriteReceipt>,
    },
    Typing {
        connection_id: Uuid,
        is_typing: bool,
    },
    /// Sent by the room's writer when a queued mutation settles.
    WriteFinished(WriteOutcome),
    #[cfg(test)]
    Crash,
}

/// A mutation queued to the room's writer, processed strictly in FIFO order.
pub(crate) enum WriteOp {
    Append {
        message: ChatMessage,
        client_nonce: Option<String>,
        deadline: Instant,
        reply_tx: ReplyTx<WriteReceipt>,
    },
    Update {
        caller_id: Uuid,
        message_id: Uuid,
        body: String,
        deadline: Instant,
        reply_tx: ReplyTx<WriteReceipt>,
    },
    Tombstone {
        caller_id: Uuid,
        caller_role: RoomRole,
        message_id: Uuid,
        deadline: Instant,
        reply_tx: ReplyTx<WriteReceipt>,
    },
}

impl WriteOp {
    pub(crate) fn deadline(&self) -> Instant {
        match self {
            Self::Append { deadline, .. }
            | Self::Update { deadline, .. }
            | Self::Tombstone { deadline, .. } => *deadline,
        }
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        let reply_tx = match self {
            Self::Append { reply_tx, .. }
            | Self::Update { reply_tx, .. }
            | Self::Tombstone { reply_tx, .. } => reply_tx,
        };
        reply_tx.is_closed()
    }

    pub(crate) fn into_reply_tx(self) -> ReplyTx<WriteReceipt> {
        match self {
            Self::Append { reply_tx, .. }
            | Self::Update { reply_tx, .. }
            | Self::Tombstone { reply_tx, .. } => reply_tx,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Committed {
    Created { message: ChatMessage, client_nonce: Option<String>, duplicate: bool },
    Edited { message: ChatMessage },
    Deleted { message: ChatMessage },
}

pub struct WriteOutcome {
    pub(crate) result: Result<Committed, ChatError>,
    pub(crate) reply_tx: ReplyTx<WriteReceipt>,
    /// Store head observed by a resync, when it differed from the writer's own.
    pub(crate) resynced_head: Option<i64>,
}
