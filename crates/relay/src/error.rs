use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;
use workshop_chat_common::protocol::ws::WsMessage;

use crate::store::StoreError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    InvalidMessage,
    Unauthenticated,
    Forbidden,
    NotFound,
    NotJoined,
    StoreUnavailable,
    Timeout,
    RoomReset,
    UpgradeRequired,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::NotJoined => "NOT_JOINED",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::RoomReset => "ROOM_RESET",
            Self::UpgradeRequired => "UPGRADE_REQUIRED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed | Self::InvalidMessage => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotJoined => StatusCode::CONFLICT,
            Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::RoomReset => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable | Self::Timeout | Self::RoomReset | Self::InternalError
        )
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::InvalidMessage => "invalid websocket frame payload",
            Self::Unauthenticated => "missing or invalid identity token",
            Self::Forbidden => "caller lacks required permission",
            Self::NotFound => "requested resource not found",
            Self::NotJoined => "join a room before sending room actions",
            Self::StoreUnavailable => "message store is unavailable",
            Self::Timeout => "operation timed out",
            Self::RoomReset => "room was reset; rejoin to continue",
            Self::UpgradeRequired => "client protocol version is not supported",
            Self::InternalError => "internal server error",
        }
    }
}

/// Failure of a chat action, reported only to the connection that issued it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("connection has not joined room {room_id}")]
    NotJoined { room_id: Uuid },
    #[error("message store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("room {room_id} was reset")]
    RoomReset { room_id: Uuid },
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthenticated(_) => ErrorCode::Unauthenticated,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::NotJoined { .. } => ErrorCode::NotJoined,
            Self::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::RoomReset { .. } => ErrorCode::RoomReset,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().retryable()
    }

    /// Error frame for the initiating connection.
    pub fn to_ws_message(&self, room_id: Option<Uuid>) -> WsMessage {
        let message = match self {
            Self::Internal(_) => ErrorCode::InternalError.default_message().to_string(),
            Self::StoreUnavailable(_) => ErrorCode::StoreUnavailable.default_message().to_string(),
            other => other.to_string(),
        };
        WsMessage::Error {
            code: self.code().as_str().to_string(),
            message,
            retryable: self.is_retryable(),
            room_id,
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { message_id } => Self::NotFound(format!("message {message_id}")),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<ChatError> for RelayError {
    fn from(error: ChatError) -> Self {
        let message = match &error {
            ChatError::Internal(_) | ChatError::StoreUnavailable(_) => {
                error.code().default_message().to_string()
            }
            other => other.to_string(),
        };
        RelayError::new(error.code(), message)
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, http::StatusCode, response::IntoResponse};
    use serde_json::Value;
    use uuid::Uuid;
    use workshop_chat_common::protocol::ws::WsMessage;

    use super::{with_request_id_scope, ChatError, ErrorCode, RelayError};
    use crate::store::StoreError;

    async fn body_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("error response body should be readable");
        serde_json::from_slice(&body).expect("error response body should be valid json")
    }

    #[tokio::test]
    async fn relay_error_uses_scoped_request_id() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            RelayError::from_code(ErrorCode::StoreUnavailable).into_response()
        })
        .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "STORE_UNAVAILABLE");
        assert_eq!(parsed["error"]["retryable"], true);
        assert_eq!(parsed["error"]["request_id"], "req-scoped-123");
        assert_eq!(parsed["error"]["details"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn explicit_request_id_overrides_scope() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            RelayError::from_code(ErrorCode::Forbidden)
                .with_request_id("req-explicit-456")
                .into_response()
        })
        .await;

        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["request_id"], "req-explicit-456");
        assert_eq!(parsed["error"]["retryable"], false);
    }

    #[test]
    fn taxonomy_retryability() {
        assert!(ChatError::StoreUnavailable("io".into()).is_retryable());
        assert!(ChatError::Timeout("send_message").is_retryable());
        assert!(ChatError::RoomReset { room_id: Uuid::new_v4() }.is_retryable());
        assert!(!ChatError::Forbidden("no".into()).is_retryable());
        assert!(!ChatError::Validation("empty".into()).is_retryable());
        assert!(!ChatError::Unauthenticated("bad".into()).is_retryable());
        assert!(!ChatError::NotFound("gone".into()).is_retryable());
    }

    #[test]
    fn store_errors_map_to_not_found_or_unavailable() {
        let message_id = Uuid::new_v4();
        assert_eq!(
            ChatError::from(StoreError::NotFound { message_id }).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            ChatError::from(StoreError::Unavailable("connection reset".into())).code(),
            ErrorCode::StoreUnavailable
        );
    }

    #[test]
    fn ws_error_frame_hides_internal_detail() {
        let room_id = Uuid::new_v4();
        let frame = ChatError::StoreUnavailable("pg: connection reset by peer".into())
            .to_ws_message(Some(room_id));
        match frame {
            WsMessage::Error { code, message, retryable, room_id: frame_room } => {
                assert_eq!(code, "STORE_UNAVAILABLE");
                assert!(!message.contains("pg:"));
                assert!(retryable);
                assert_eq!(frame_room, Some(room_id));
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chat_error_converts_to_http_error() {
        let response =
            RelayError::from(ChatError::Forbidden("not enrolled".into())).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "FORBIDDEN");
        assert_eq!(parsed["error"]["message"], "forbidden: not enrolled");
    }
}
