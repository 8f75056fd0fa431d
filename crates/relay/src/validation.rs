// Payload validation for chat actions and websocket frames.

use workshop_chat_common::types::MessageKind;

use crate::error::ChatError;

/// Maximum WebSocket frame payload in bytes (256 KiB).
pub const MAX_WS_FRAME_BYTES: usize = 256 * 1024;

/// Maximum REST request body in bytes (1 MiB).
pub const MAX_REST_BODY_BYTES: usize = 1024 * 1024;

/// Maximum message body length, counted in characters.
pub const MAX_BODY_CHARS: usize = 4_000;

/// Maximum attachment reference length in bytes.
pub const MAX_ATTACHMENT_REF_BYTES: usize = 2_048;

/// Maximum client nonce length in bytes.
pub const MAX_CLIENT_NONCE_BYTES: usize = 128;

/// A send request that passed validation, with blank optionals normalized away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSend {
    pub body: String,
    pub kind: MessageKind,
    pub attachment_ref: Option<String>,
    pub client_nonce: Option<String>,
}

pub fn validate_send(
    body: String,
    kind: MessageKind,
    attachment_ref: Option<String>,
    client_nonce: Option<String>,
) -> Result<ValidatedSend, ChatError> {
    let attachment_ref = attachment_ref.filter(|value| !value.trim().is_empty());
    let client_nonce = client_nonce.filter(|value| !value.trim().is_empty());

    validate_body(&body, kind)?;

    match (&attachment_ref, kind.requires_attachment()) {
        (None, true) => {
            return Err(ChatError::Validation(format!(
                "{} messages require an attachment_ref",
                kind.as_str()
            )));
        }
        (Some(_), false) => {
            return Err(ChatError::Validation("text messages cannot carry an attachment".into()));
        }
        (Some(reference), true) if reference.len() > MAX_ATTACHMENT_REF_BYTES => {
            return Err(ChatError::Validation(format!(
                "attachment_ref exceeds {MAX_ATTACHMENT_REF_BYTES} bytes"
            )));
        }
        _ => {}
    }

    if client_nonce.as_ref().is_some_and(|nonce| nonce.len() > MAX_CLIENT_NONCE_BYTES) {
        return Err(ChatError::Validation(format!(
            "client_nonce exceeds {MAX_CLIENT_NONCE_BYTES} bytes"
        )));
    }

    Ok(ValidatedSend { body, kind, attachment_ref, client_nonce })
}

/// Text bodies must carry visible content; image and file captions may be empty.
pub fn validate_body(body: &str, kind: MessageKind) -> Result<(), ChatError> {
    if kind == MessageKind::Text && body.trim().is_empty() {
        return Err(ChatError::Validation("message body must not be empty".into()));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(ChatError::Validation(format!(
            "message body exceeds {MAX_BODY_CHARS} characters"
        )));
    }
    Ok(())
}

/// Check if a WebSocket frame exceeds the size limit.
/// Returns an error message suitable for sending back as a WS close reason.
pub fn check_ws_frame_size(payload: &[u8]) -> Result<(), String> {
    if payload.len() > MAX_WS_FRAME_BYTES {
        Err(format!(
            "frame size {} bytes exceeds limit of {} bytes",
            payload.len(),
            MAX_WS_FRAME_BYTES
        ))
    } else {
        Ok(())
    }
}
