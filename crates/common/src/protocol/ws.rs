// WebSocket message types for the workshop-chat.v1 protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ChatMessage, MessageKind, PresenceUser, RoomRole, TypingUser};

/// Protocol version spoken by this build.
pub const CURRENT_PROTOCOL_VERSION: &str = "workshop-chat.v1";

/// Versions a relay accepts in `hello`, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[CURRENT_PROTOCOL_VERSION];

/// All message types in the workshop-chat.v1 WebSocket protocol.
///
/// Room events that change message state carry the message `seq`; presence and
/// typing events carry `ephemeral: true` instead, since they have no slot in
/// the room's ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: identity assertion; must be the first frame.
    Hello {
        protocol_version: String,
        token: String,
    },

    /// Server -> Client: identity accepted.
    HelloAck {
        user_id: Uuid,
        display_name: String,
        server_time: String,
    },

    /// Client -> Server: enter a workshop room.
    JoinRoom {
        room_id: Uuid,
    },

    /// Server -> Client: admitted to a room, with the most recent history page.
    Joined {
        room_id: Uuid,
        role: RoomRole,
        head_seq: i64,
        presence: usize,
        recent_messages: Vec<ChatMessage>,
    },

    /// Client -> Server: leave the current room.
    LeaveRoom {
        room_id: Uuid,
    },

    /// Server -> Client: the connection left the room.
    Left {
        room_id: Uuid,
    },

    /// Client -> Server: post a message.
    SendMessage {
        room_id: Uuid,
        body: String,
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_nonce: Option<String>,
    },

    /// Client -> Server: rewrite the body of one of the caller's messages.
    EditMessage {
        room_id: Uuid,
        message_id: Uuid,
        body: String,
    },

    /// Client -> Server: tombstone a message.
    DeleteMessage {
        room_id: Uuid,
        message_id: Uuid,
    },

    /// Client -> Server: the caller started typing.
    TypingStart {
        room_id: Uuid,
    },

    /// Client -> Server: the caller stopped typing.
    TypingStop {
        room_id: Uuid,
    },

    /// Server -> Client: a message was persisted.
    MessageCreated {
        room_id: Uuid,
        seq: i64,
        message: ChatMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_nonce: Option<String>,
    },

    /// Server -> Client: a message body was edited.
    MessageEdited {
        room_id: Uuid,
        seq: i64,
        message: ChatMessage,
    },

    /// Server -> Client: a message was tombstoned. Never carries the body.
    MessageDeleted {
        room_id: Uuid,
        seq: i64,
        message_id: Uuid,
        deleted_at: String,
    },

    /// Server -> Client: the set of distinct users in the room changed.
    PresenceChanged {
        room_id: Uuid,
        count: usize,
        users: Vec<PresenceUser>,
        ephemeral: bool,
    },

    /// Server -> Client: the aggregate typing set changed.
    TypingChanged {
        room_id: Uuid,
        typing: Vec<TypingUser>,
        ephemeral: bool,
    },

    /// Server -> Client: error, delivered only to the initiating connection.
    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<Uuid>,
    },
}

impl WsMessage {
    /// Snake-case frame name, as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::HelloAck { .. } => "hello_ack",
            Self::JoinRoom { .. } => "join_room",
            Self::Joined { .. } => "joined",
            Self::LeaveRoom { .. } => "leave_room",
            Self::Left { .. } => "left",
            Self::SendMessage { .. } => "send_message",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage { .. } => "delete_message",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::MessageCreated { .. } => "message_created",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::PresenceChanged { .. } => "presence_changed",
            Self::TypingChanged { .. } => "typing_changed",
            Self::Error { .. } => "error",
        }
    }
}
