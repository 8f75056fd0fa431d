use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;
use workshop_chat_common::protocol::ws::WsMessage;
use workshop_chat_common::types::{MessageKind, RoomRole};
use workshop_chat_relay::{
    error::ChatError,
    room::{Member, RoomRegistry, RoomSettings},
    store::{MemoryMessageStore, MessageStore},
    validation::validate_send,
};

const OUTBOUND_CAPACITY: usize = 1024;

struct Connection {
    connection_id: Uuid,
    events: mpsc::Receiver<WsMessage>,
}

async fn admit_members(registry: &RoomRegistry, room_id: Uuid, count: usize) -> Vec<Connection> {
    let mut connections = Vec::with_capacity(count);
    for index in 0..count {
        let (outbound, events) = mpsc::channel(OUTBOUND_CAPACITY);
        let member = Member {
            connection_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            display_name: format!("member-{index}"),
            role: RoomRole::Member,
            joined_at: Utc::now(),
        };
        let connection_id = member.connection_id;
        registry.admit(room_id, member, outbound).await.expect("admit member");
        connections.push(Connection { connection_id, events });
    }
    connections
}

fn created_seqs(events: &mut mpsc::Receiver<WsMessage>) -> Vec<i64> {
    let mut seqs = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WsMessage::MessageCreated { seq, message, .. } = event {
            assert_eq!(seq, message.seq);
            seqs.push(seq);
        }
    }
    seqs
}

async fn send_text(
    registry: &RoomRegistry,
    room_id: Uuid,
    connection_id: Uuid,
    body: String,
) -> Result<i64, ChatError> {
    let message = validate_send(body, MessageKind::Text, None, None)?;
    let deadline = Instant::now() + Duration::from_secs(5);
    let receipt = registry.send_message(room_id, connection_id, message, deadline).await?;
    Ok(receipt.message.seq)
}

async fn run_concurrent_sends(senders: Vec<usize>, members: usize, outages: usize) {
    let memory = MemoryMessageStore::default();
    let registry =
        RoomRegistry::new(MessageStore::Memory(memory.clone()), RoomSettings::default());
    let room_id = Uuid::new_v4();
    let mut connections = admit_members(&registry, room_id, members).await;

    let mut tasks = Vec::with_capacity(senders.len());
    for (index, sender) in senders.iter().enumerate() {
        let registry = registry.clone();
        let connection_id = connections[sender % members].connection_id;
        tasks.push(tokio::spawn(async move {
            send_text(&registry, room_id, connection_id, format!("message {index}")).await
        }));
    }

    let mut assigned = Vec::with_capacity(tasks.len());
    for task in tasks {
        assigned.push(task.await.expect("send task").expect("send succeeds"));
    }
    assigned.sort_unstable();
    let expected: Vec<i64> = (1..=senders.len() as i64).collect();
    assert_eq!(assigned, expected, "seqs must be distinct and contiguous");

    // Failed writes never consume a slot.
    memory.set_unavailable(true);
    for _ in 0..outages {
        let result = send_text(&registry, room_id, connections[0].connection_id, "lost".into()).await;
        assert!(matches!(result, Err(ChatError::StoreUnavailable(_))), "got {result:?}");
    }
    memory.set_unavailable(false);
    let next = send_text(&registry, room_id, connections[0].connection_id, "after".into())
        .await
        .expect("send after recovery");
    assert_eq!(next, senders.len() as i64 + 1);

    let mut expected_stream = expected;
    expected_stream.push(next);
    for connection in &mut connections {
        assert_eq!(created_seqs(&mut connection.events), expected_stream);
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        max_shrink_iters: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn concurrent_sends_receive_contiguous_seqs_in_fanout_order(
        senders in proptest::collection::vec(0usize..8, 1..40),
        members in 1usize..5,
        outages in 0usize..3,
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .expect("tokio runtime");
        runtime.block_on(run_concurrent_sends(senders, members, outages));
    }
}
