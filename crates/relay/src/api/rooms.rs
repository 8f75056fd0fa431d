use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    middleware,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use workshop_chat_common::types::{ChatMessage, PresenceUser};

use crate::{
    auth::{
        gate::AuthorizationGate,
        jwt::JwtIdentityService,
        middleware::{require_bearer_auth, AuthenticatedUser},
    },
    error::{ChatError, ErrorCode, RelayError},
    room::RoomRegistry,
    store::MAX_PAGE_SIZE,
    ws::ChatContext,
};

#[derive(Clone)]
struct RoomsApiState {
    gate: AuthorizationGate,
    registry: RoomRegistry,
    default_page_size: usize,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    before_seq: Option<i64>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoryEnvelope {
    room_id: Uuid,
    messages: Vec<ChatMessage>,
    /// Pass as `before_seq` to fetch the next older page; absent once the
    /// start of the room is reached.
    next_before_seq: Option<i64>,
}

#[derive(Debug, Serialize)]
struct PresenceEnvelope {
    room_id: Uuid,
    count: usize,
    users: Vec<PresenceUser>,
}

pub fn router(context: ChatContext) -> Router {
    let identity = context.identity.clone();
    build_router(context.gate, context.registry, context.config.history_page_size, identity)
}

fn build_router(
    gate: AuthorizationGate,
    registry: RoomRegistry,
    default_page_size: usize,
    identity: Arc<JwtIdentityService>,
) -> Router {
    Router::new()
        .route("/v1/rooms/{room_id}/messages", get(list_messages))
        .route("/v1/rooms/{room_id}/presence", get(room_presence))
        .with_state(RoomsApiState { gate, registry, default_page_size })
        .route_layer(middleware::from_fn_with_state(identity, require_bearer_auth))
}

async fn list_messages(
    State(state): State<RoomsApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryEnvelope>, RelayError> {
    state.gate.require_role(user.user_id, room_id).await?;

    if let Some(before_seq) = query.before_seq {
        if before_seq < 1 {
            return Err(RelayError::new(
                ErrorCode::ValidationFailed,
                "before_seq must be a positive sequence number",
            ));
        }
    }
    let limit = query.limit.unwrap_or(state.default_page_size).clamp(1, MAX_PAGE_SIZE);

    let messages = state
        .registry
        .store()
        .list_before(room_id, query.before_seq, limit)
        .await
        .map_err(ChatError::from)?;

    let next_before_seq = match messages.first() {
        Some(oldest) if messages.len() == limit && oldest.seq > 1 => Some(oldest.seq),
        _ => None,
    };

    Ok(Json(HistoryEnvelope {
        room_id,
        messages: messages.into_iter().map(ChatMessage::elided).collect(),
        next_before_seq,
    }))
}

async fn room_presence(
    State(state): State<RoomsApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<PresenceEnvelope>, RelayError> {
    state.gate.require_role(user.user_id, room_id).await?;
    let snapshot = state.registry.presence(room_id).await;
    Ok(Json(PresenceEnvelope { room_id, count: snapshot.count, users: snapshot.users }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::gate::EnrollmentSource,
        room::RoomSettings,
        store::MessageStore,
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use chrono::Utc;
    use std::time::Duration;
    use tower::ServiceExt;
    use workshop_chat_common::types::{MessageKind, RoomRole};

    fn test_jwt_service() -> Arc<JwtIdentityService> {
        Arc::new(
            JwtIdentityService::new("workshop_chat_rooms_api_secret_0123456789")
                .expect("jwt service"),
        )
    }

    struct TestApp {
        app: Router,
        jwt: Arc<JwtIdentityService>,
        source: EnrollmentSource,
        store: MessageStore,
    }

    fn test_app() -> TestApp {
        let jwt = test_jwt_service();
        let source = EnrollmentSource::memory();
        let store = MessageStore::memory();
        let gate = AuthorizationGate::new(source.clone(), Duration::ZERO);
        let registry = RoomRegistry::new(store.clone(), RoomSettings::default());
        let app = build_router(gate, registry, 50, jwt.clone());
        TestApp { app, jwt, source, store }
    }

    fn get_request(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request should build")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("response body should be readable");
        serde_json::from_slice(&bytes).expect("response body should be json")
    }

    async fn seed_messages(store: &MessageStore, room_id: Uuid, author_id: Uuid, count: i64) {
        for seq in 1..=count {
            let message = ChatMessage {
                id: Uuid::new_v4(),
                room_id,
                author_id,
                author_name: "Ada".to_string(),
                body: format!("message {seq}"),
                kind: MessageKind::Text,
                attachment_ref: None,
                seq,
                created_at: Utc::now(),
                edited_at: None,
                deleted_at: None,
            };
            store.append(&message).await.expect("seed append");
        }
    }

    #[tokio::test]
    async fn history_requires_bearer_token() {
        let test = test_app();
        let room_id = Uuid::new_v4();
        let request = Request::builder()
            .uri(format!("/v1/rooms/{room_id}/messages"))
            .body(Body::empty())
            .expect("request should build");

        let response = test.app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn history_is_forbidden_without_enrollment() {
        let test = test_app();
        let room_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let token = test.jwt.issue_identity_token(user_id, "Ada").expect("token");

        let response = test
            .app
            .oneshot(get_request(&format!("/v1/rooms/{room_id}/messages"), &token))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "FORBIDDEN");
        assert_eq!(body["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn history_pages_backwards_in_ascending_order() {
        let test = test_app();
        let room_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        test.source.set_role(room_id, user_id, Some(RoomRole::Member)).await;
        seed_messages(&test.store, room_id, user_id, 5).await;
        let token = test.jwt.issue_identity_token(user_id, "Ada").expect("token");

        let response = test
            .app
            .clone()
            .oneshot(get_request(&format!("/v1/rooms/{room_id}/messages?limit=2"), &token))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let seqs: Vec<i64> = body["messages"]
            .as_array()
            .expect("messages array")
            .iter()
            .map(|message| message["seq"].as_i64().expect("seq"))
            .collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(body["next_before_seq"], 4);

        let response = test
            .app
            .oneshot(get_request(
                &format!("/v1/rooms/{room_id}/messages?before_seq=4&limit=10"),
                &token,
            ))
            .await
            .expect("response");
        let body = body_json(response).await;
        let seqs: Vec<i64> = body["messages"]
            .as_array()
            .expect("messages array")
            .iter()
            .map(|message| message["seq"].as_i64().expect("seq"))
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(body["next_before_seq"].is_null());
    }

    #[tokio::test]
    async fn history_elides_tombstoned_bodies() {
        let test = test_app();
        let room_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        test.source.set_role(room_id, user_id, Some(RoomRole::Owner)).await;
        seed_messages(&test.store, room_id, user_id, 2).await;
        let first = test.store.list_recent(room_id, 10).await.expect("list")[0].clone();
        test.store.tombstone(first.id, Utc::now()).await.expect("tombstone");
        let token = test.jwt.issue_identity_token(user_id, "Ada").expect("token");

        let response = test
            .app
            .oneshot(get_request(&format!("/v1/rooms/{room_id}/messages"), &token))
            .await
            .expect("response");
        let body = body_json(response).await;
        let messages = body["messages"].as_array().expect("messages array");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["seq"], 1);
        assert_eq!(messages[0]["body"], "");
        assert!(messages[0]["deleted_at"].is_string());
        assert_eq!(messages[1]["body"], "message 2");
    }

    #[tokio::test]
    async fn history_rejects_non_positive_cursor() {
        let test = test_app();
        let room_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        test.source.set_role(room_id, user_id, Some(RoomRole::Member)).await;
        let token = test.jwt.issue_identity_token(user_id, "Ada").expect("token");

        let response = test
            .app
            .oneshot(get_request(&format!("/v1/rooms/{room_id}/messages?before_seq=0"), &token))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn presence_of_an_idle_room_is_empty() {
        let test = test_app();
        let room_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        test.source.set_role(room_id, user_id, Some(RoomRole::Member)).await;
        let token = test.jwt.issue_identity_token(user_id, "Ada").expect("token");

        let response = test
            .app
            .oneshot(get_request(&format!("/v1/rooms/{room_id}/presence"), &token))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["room_id"], room_id.to_string());
        assert_eq!(body["count"], 0);
        assert_eq!(body["users"], serde_json::json!([]));
    }
}
