// Core domain types shared by the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content kind of a chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

impl MessageKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    /// Image and file messages point at an upload; text messages carry their body inline.
    pub const fn requires_attachment(self) -> bool {
        matches!(self, Self::Image | Self::File)
    }
}

/// A caller's standing in a workshop room.
///
/// Owners run the workshop and may moderate (delete) any message. Members are
/// enrolled students. Callers with neither role are not represented here: the
/// authorization gate reports them as `None`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoomRole {
    Owner,
    Member,
}

impl RoomRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Member => "member",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(Self::Owner),
            "member" => Some(Self::Member),
            _ => None,
        }
    }

    pub const fn can_moderate(self) -> bool {
        matches!(self, Self::Owner)
    }
}

/// A chat message as stored and delivered.
///
/// `seq` is assigned once by the room when the message is first persisted and
/// never changes afterwards. Deletion sets `deleted_at` and keeps the row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub author_id: Uuid,
    pub author_name: String,
    pub body: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<String>,
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns the message as clients may see it: tombstones keep their slot
    /// and metadata but lose body and attachment.
    pub fn elided(mut self) -> Self {
        if self.is_deleted() {
            self.body.clear();
            self.attachment_ref = None;
        }
        self
    }
}

/// One distinct user currently present in a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceUser {
    pub user_id: Uuid,
    pub display_name: String,
}

/// One user currently typing in a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: Uuid,
    pub display_name: String,
}
