use axum::extract::ws::{Message, WebSocket};
use uuid::Uuid;
use workshop_chat_common::protocol::ws::WsMessage;

use crate::error::ErrorCode;

pub fn decode_message(raw: &str) -> Result<WsMessage, serde_json::Error> {
    serde_json::from_str::<WsMessage>(raw)
}

pub fn encode_message(message: &WsMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let encoded = encode_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// Error frame for failures that have no `ChatError` counterpart (framing,
/// protocol negotiation).
pub fn error_frame(code: ErrorCode, message: impl Into<String>, room_id: Option<Uuid>) -> WsMessage {
    WsMessage::Error {
        code: code.as_str().to_string(),
        message: message.into(),
        retryable: code.retryable(),
        room_id,
    }
}

/// Frames only the relay may emit.
pub fn is_server_frame(message: &WsMessage) -> bool {
    matches!(
        message,
        WsMessage::HelloAck { .. }
            | WsMessage::Joined { .. }
            | WsMessage::Left { .. }
            | WsMessage::MessageCreated { .. }
            | WsMessage::MessageEdited { .. }
            | WsMessage::MessageDeleted { .. }
            | WsMessage::PresenceChanged { .. }
            | WsMessage::TypingChanged { .. }
            | WsMessage::Error { .. }
    )
}
