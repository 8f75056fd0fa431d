use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;
use workshop_chat_common::types::RoomRole;
use workshop_chat_relay::{
    auth::{
        gate::{AuthorizationGate, EnrollmentSource},
        jwt::JwtIdentityService,
    },
    build_router,
    config::ChatConfig,
    metrics::ChatMetrics,
    room::{RoomRegistry, RoomSettings},
    store::{MemoryMessageStore, MessageStore},
    ws::ChatContext,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "workshop_chat_integration_secret_0123456789";
const FRAME_WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    identity: Arc<JwtIdentityService>,
    source: EnrollmentSource,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(ChatConfig::default(), MemoryMessageStore::default()).await
    }

    async fn start_with(config: ChatConfig, store: MemoryMessageStore) -> Self {
        let identity = Arc::new(JwtIdentityService::new(SECRET).expect("jwt service"));
        let source = EnrollmentSource::memory();
        let gate = AuthorizationGate::new(source.clone(), Duration::ZERO);
        let registry = RoomRegistry::new(MessageStore::Memory(store), RoomSettings::from(&config));
        let context = ChatContext::new(Arc::clone(&identity), gate, registry, config);
        let app = build_router(context, Arc::new(ChatMetrics::default()), None);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server");
        });

        Self { addr, identity, source }
    }

    async fn enroll(&self, room_id: Uuid, user_id: Uuid, role: RoomRole) {
        self.source.set_role(room_id, user_id, Some(role)).await;
    }

    async fn revoke(&self, room_id: Uuid, user_id: Uuid) {
        self.source.set_role(room_id, user_id, None).await;
    }

    async fn connect(&self) -> Socket {
        let url = format!("ws://{}/v1/chat/ws", self.addr);
        let (socket, _) = connect_async(url).await.expect("websocket handshake");
        socket
    }

    /// Connects and completes the hello handshake.
    async fn connect_as(&self, user_id: Uuid, name: &str) -> Socket {
        let mut socket = self.connect().await;
        let token = self.identity.issue_identity_token(user_id, name).expect("token");
        send(
            &mut socket,
            json!({"type": "hello", "protocol_version": "workshop-chat.v1", "token": token}),
        )
        .await;
        let ack = expect_frame(&mut socket, "hello_ack").await;
        assert_eq!(ack["user_id"], user_id.to_string());
        socket
    }
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::text(frame.to_string())).await.expect("send frame");
}

async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        let incoming = tokio::time::timeout(FRAME_WAIT, socket.next())
            .await
            .expect("frame should arrive in time")
            .expect("socket should stay open")
            .expect("frame should be readable");
        match incoming {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("server frames are json")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected websocket message: {other:?}"),
        }
    }
}

/// Next frame of the given type, skipping ephemeral presence and typing frames.
async fn expect_frame(socket: &mut Socket, kind: &str) -> Value {
    loop {
        let frame = next_frame(socket).await;
        if frame["type"] == kind {
            return frame;
        }
        let skippable = frame["type"] == "presence_changed" || frame["type"] == "typing_changed";
        assert!(skippable, "expected `{kind}`, got {frame}");
    }
}

/// Fails on any text frame arriving within `wait`.
async fn expect_quiet(socket: &mut Socket, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    while let Ok(incoming) = tokio::time::timeout_at(deadline, socket.next()).await {
        match incoming {
            Some(Ok(Message::Text(text))) => panic!("unexpected frame: {}", text.as_str()),
            Some(Ok(_)) => continue,
            None | Some(Err(_)) => panic!("socket should stay open"),
        }
    }
}

fn text_frame(room_id: Uuid, body: &str) -> Value {
    json!({"type": "send_message", "room_id": room_id, "body": body, "kind": "text"})
}

async fn join(socket: &mut Socket, room_id: Uuid) -> Value {
    send(socket, json!({"type": "join_room", "room_id": room_id})).await;
    expect_frame(socket, "joined").await
}

#[tokio::test]
async fn frames_before_hello_are_unauthenticated() {
    let server = TestServer::start().await;
    let mut socket = server.connect().await;

    send(&mut socket, json!({"type": "join_room", "room_id": Uuid::new_v4()})).await;
    let error = expect_frame(&mut socket, "error").await;
    assert_eq!(error["code"], "UNAUTHENTICATED");
}

#[tokio::test]
async fn malformed_frames_are_rejected_without_closing() {
    let server = TestServer::start().await;
    let user_id = Uuid::new_v4();
    let mut socket = server.connect_as(user_id, "Ada").await;

    socket.send(Message::text("{not json")).await.expect("send garbage");
    let error = expect_frame(&mut socket, "error").await;
    assert_eq!(error["code"], "INVALID_MESSAGE");

    let room_id = Uuid::new_v4();
    server.enroll(room_id, user_id, RoomRole::Member).await;
    let joined = join(&mut socket, room_id).await;
    assert_eq!(joined["room_id"], room_id.to_string());
}

#[tokio::test]
async fn unenrolled_user_cannot_join() {
    let server = TestServer::start().await;
    let mut socket = server.connect_as(Uuid::new_v4(), "Mallory").await;

    send(&mut socket, json!({"type": "join_room", "room_id": Uuid::new_v4()})).await;
    let error = expect_frame(&mut socket, "error").await;
    assert_eq!(error["code"], "FORBIDDEN");
    assert_eq!(error["retryable"], false);
}

#[tokio::test]
async fn two_members_chat_in_seq_order_and_owner_moderates() {
    let server = TestServer::start().await;
    let room_id = Uuid::new_v4();
    let (owner_id, member_id) = (Uuid::new_v4(), Uuid::new_v4());
    server.enroll(room_id, owner_id, RoomRole::Owner).await;
    server.enroll(room_id, member_id, RoomRole::Member).await;

    let mut owner = server.connect_as(owner_id, "Olive").await;
    let joined = join(&mut owner, room_id).await;
    assert_eq!(joined["role"], "owner");
    assert_eq!(joined["head_seq"], 0);
    assert_eq!(joined["presence"], 1);

    let mut member = server.connect_as(member_id, "Milo").await;
    let joined = join(&mut member, room_id).await;
    assert_eq!(joined["role"], "member");
    assert_eq!(joined["presence"], 2);

    let presence = expect_frame(&mut owner, "presence_changed").await;
    assert_eq!(presence["count"], 2);
    assert_eq!(presence["ephemeral"], true);

    for body in ["first", "second", "third"] {
        send(
            &mut member,
            json!({"type": "send_message", "room_id": room_id, "body": body, "kind": "text"}),
        )
        .await;
    }

    let mut member_message_ids = Vec::new();
    for expected_seq in 1..=3 {
        let seen_by_member = expect_frame(&mut member, "message_created").await;
        let seen_by_owner = expect_frame(&mut owner, "message_created").await;
        assert_eq!(seen_by_member["seq"], expected_seq);
        assert_eq!(seen_by_owner, seen_by_member);
        assert_eq!(seen_by_member["message"]["author_id"], member_id.to_string());
        member_message_ids.push(seen_by_member["message"]["id"].clone());
    }

    let unknown_delete = json!({
        "type": "delete_message",
        "room_id": room_id,
        "message_id": Uuid::new_v4(),
    });
    send(&mut member, unknown_delete).await;
    let error = expect_frame(&mut member, "error").await;
    assert_eq!(error["code"], "NOT_FOUND");

    send(
        &mut owner,
        json!({"type": "send_message", "room_id": room_id, "body": "mod", "kind": "text"}),
    )
    .await;
    let created = expect_frame(&mut owner, "message_created").await;
    assert_eq!(created["seq"], 4);
    let created = expect_frame(&mut member, "message_created").await;
    let owner_message_id = created["message"]["id"].clone();

    send(
        &mut member,
        json!({
            "type": "edit_message",
            "room_id": room_id,
            "message_id": owner_message_id,
            "body": "hijacked",
        }),
    )
    .await;
    let error = expect_frame(&mut member, "error").await;
    assert_eq!(error["code"], "FORBIDDEN");

    send(
        &mut member,
        json!({"type": "delete_message", "room_id": room_id, "message_id": owner_message_id}),
    )
    .await;
    let error = expect_frame(&mut member, "error").await;
    assert_eq!(error["code"], "FORBIDDEN");

    send(
        &mut owner,
        json!({"type": "delete_message", "room_id": room_id, "message_id": owner_message_id}),
    )
    .await;
    for socket in [&mut owner, &mut member] {
        let deleted = expect_frame(socket, "message_deleted").await;
        assert_eq!(deleted["seq"], 4);
        assert_eq!(deleted["message_id"], owner_message_id);
        assert!(deleted.get("body").is_none());
    }

    send(
        &mut owner,
        json!({"type": "delete_message", "room_id": room_id, "message_id": member_message_ids[1]}),
    )
    .await;
    for socket in [&mut owner, &mut member] {
        let deleted = expect_frame(socket, "message_deleted").await;
        assert_eq!(deleted["seq"], 2);
    }

    send(
        &mut member,
        json!({
            "type": "edit_message",
            "room_id": room_id,
            "message_id": member_message_ids[0],
            "body": "first, revised",
        }),
    )
    .await;
    for socket in [&mut owner, &mut member] {
        let edited = expect_frame(socket, "message_edited").await;
        assert_eq!(edited["seq"], 1);
        assert_eq!(edited["message"]["body"], "first, revised");
        assert!(edited["message"]["edited_at"].is_string());
    }

    member.close(None).await.expect("member disconnects");
    let presence = expect_frame(&mut owner, "presence_changed").await;
    assert_eq!(presence["count"], 1);
}

#[tokio::test]
async fn late_joiner_receives_recent_history() {
    let server = TestServer::start().await;
    let room_id = Uuid::new_v4();
    let (first_id, late_id) = (Uuid::new_v4(), Uuid::new_v4());
    server.enroll(room_id, first_id, RoomRole::Member).await;
    server.enroll(room_id, late_id, RoomRole::Member).await;

    let mut first = server.connect_as(first_id, "Ada").await;
    join(&mut first, room_id).await;
    for body in ["one", "two"] {
        send(
            &mut first,
            json!({"type": "send_message", "room_id": room_id, "body": body, "kind": "text"}),
        )
        .await;
        expect_frame(&mut first, "message_created").await;
    }

    let mut late = server.connect_as(late_id, "Bea").await;
    let joined = join(&mut late, room_id).await;
    assert_eq!(joined["head_seq"], 2);
    let bodies: Vec<&str> = joined["recent_messages"]
        .as_array()
        .expect("recent messages")
        .iter()
        .map(|message| message["body"].as_str().expect("body"))
        .collect();
    assert_eq!(bodies, vec!["one", "two"]);
}

#[tokio::test]
async fn unsupported_protocol_version_closes_the_socket() {
    let server = TestServer::start().await;
    let mut socket = server.connect().await;
    let token = server.identity.issue_identity_token(Uuid::new_v4(), "Ada").expect("token");

    send(
        &mut socket,
        json!({"type": "hello", "protocol_version": "workshop-chat.v0", "token": token}),
    )
    .await;
    let error = expect_frame(&mut socket, "error").await;
    assert_eq!(error["code"], "UPGRADE_REQUIRED");

    let closing = tokio::time::timeout(FRAME_WAIT, socket.next())
        .await
        .expect("close should arrive in time");
    match closing {
        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn revoked_member_is_evicted_by_the_periodic_check() {
    let config = ChatConfig { authz_cache_ttl: Duration::from_millis(100), ..ChatConfig::default() };
    let server = TestServer::start_with(config, MemoryMessageStore::default()).await;
    let room_id = Uuid::new_v4();
    let (ada_id, bob_id) = (Uuid::new_v4(), Uuid::new_v4());
    server.enroll(room_id, ada_id, RoomRole::Member).await;
    server.enroll(room_id, bob_id, RoomRole::Member).await;

    let mut ada = server.connect_as(ada_id, "Ada").await;
    join(&mut ada, room_id).await;
    let mut bob = server.connect_as(bob_id, "Bob").await;
    join(&mut bob, room_id).await;

    server.revoke(room_id, bob_id).await;
    let left = expect_frame(&mut bob, "left").await;
    assert_eq!(left["room_id"], room_id.to_string());
    let error = expect_frame(&mut bob, "error").await;
    assert_eq!(error["code"], "FORBIDDEN");
    assert_eq!(error["room_id"], room_id.to_string());

    for body in ["one", "two", "three"] {
        send(&mut ada, text_frame(room_id, body)).await;
    }
    for expected_seq in 1..=3 {
        let created = expect_frame(&mut ada, "message_created").await;
        assert_eq!(created["seq"], expected_seq);
    }
    expect_quiet(&mut bob, Duration::from_millis(500)).await;
}

#[tokio::test]
async fn closing_the_socket_abandons_a_queued_send() {
    let store = MemoryMessageStore::default();
    let server = TestServer::start_with(ChatConfig::default(), store.clone()).await;
    let room_id = Uuid::new_v4();
    let (ada_id, bob_id) = (Uuid::new_v4(), Uuid::new_v4());
    server.enroll(room_id, ada_id, RoomRole::Member).await;
    server.enroll(room_id, bob_id, RoomRole::Member).await;

    let mut ada = server.connect_as(ada_id, "Ada").await;
    join(&mut ada, room_id).await;
    let mut bob = server.connect_as(bob_id, "Bob").await;
    join(&mut bob, room_id).await;

    // Bob's write holds the room writer while Ada's queues behind it.
    store.set_write_delay(Duration::from_millis(600));
    send(&mut bob, text_frame(room_id, "first")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send(&mut ada, text_frame(room_id, "abandoned")).await;
    ada.close(None).await.expect("ada disconnects");

    let created = expect_frame(&mut bob, "message_created").await;
    assert_eq!(created["seq"], 1);
    assert_eq!(created["message"]["body"], "first");

    store.set_write_delay(Duration::ZERO);
    send(&mut bob, text_frame(room_id, "second")).await;
    let created = expect_frame(&mut bob, "message_created").await;
    assert_eq!(created["seq"], 2);
    assert_eq!(created["message"]["body"], "second");
    assert_eq!(created["message"]["author_id"], bob_id.to_string());
}
