//! Fan-out of room events to admitted connections.
//!
//! Each subscriber has a bounded outbound queue. Publishing never waits on a
//! queue: a full queue drops the event for that recipient only, so one slow
//! client cannot stall the room. Events are pushed in call order, so every
//! recipient observes the room's order with possible gaps but no reordering.

use std::collections::BTreeMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;
use uuid::Uuid;
use workshop_chat_common::protocol::ws::WsMessage;

use crate::metrics;

/// Capacity of each connection's room event queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Default)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    /// Subscribers whose receiver is gone; the caller should remove them.
    pub closed: Vec<Uuid>,
}

#[derive(Debug)]
pub struct RoomBroker {
    room_id: Uuid,
    subscribers: BTreeMap<Uuid, mpsc::Sender<WsMessage>>,
}

impl RoomBroker {
    pub fn new(room_id: Uuid) -> Self {
        Self { room_id, subscribers: BTreeMap::new() }
    }

    pub fn subscribe(&mut self, connection_id: Uuid, outbound: mpsc::Sender<WsMessage>) {
        self.subscribers.insert(connection_id, outbound);
    }

    /// Dropping the sender lets the connection observe the end of its stream.
    pub fn unsubscribe(&mut self, connection_id: Uuid) -> bool {
        self.subscribers.remove(&connection_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn publish(&self, event: &WsMessage) -> PublishReport {
        self.publish_except(event, None)
    }

    pub fn publish_except(&self, event: &WsMessage, excluded: Option<Uuid>) -> PublishReport {
        let mut report = PublishReport::default();
        for (connection_id, outbound) in &self.subscribers {
            if Some(*connection_id) == excluded {
                continue;
            }
            match outbound.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    metrics::increment_fanout_dropped();
                    warn!(
                        room_id = %self.room_id,
                        connection_id = %connection_id,
                        event = event.kind(),
                        "outbound queue full, dropping room event for slow connection"
                    );
                }
                Err(TrySendError::Closed(_)) => report.closed.push(*connection_id),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(room_id: Uuid, count: usize) -> WsMessage {
        WsMessage::PresenceChanged { room_id, count, users: Vec::new(), ephemeral: true }
    }

    #[tokio::test]
    async fn delivers_in_publish_order_and_honors_exclusion() {
        let room_id = Uuid::new_v4();
        let mut broker = RoomBroker::new(room_id);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        broker.subscribe(a, a_tx);
        broker.subscribe(b, b_tx);

        broker.publish(&presence(room_id, 1));
        let report = broker.publish_except(&presence(room_id, 2), Some(a));
        broker.publish(&presence(room_id, 3));
        assert_eq!(report.delivered, 1);

        let counts = |rx: &mut mpsc::Receiver<WsMessage>| {
            let mut seen = Vec::new();
            while let Ok(WsMessage::PresenceChanged { count, .. }) = rx.try_recv() {
                seen.push(count);
            }
            seen
        };
        assert_eq!(counts(&mut a_rx), vec![1, 3]);
        assert_eq!(counts(&mut b_rx), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn full_queue_drops_for_that_recipient_only() {
        let room_id = Uuid::new_v4();
        let mut broker = RoomBroker::new(room_id);
        let (slow, fast) = (Uuid::new_v4(), Uuid::new_v4());
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        broker.subscribe(slow, slow_tx);
        broker.subscribe(fast, fast_tx);

        broker.publish(&presence(room_id, 1));
        let report = broker.publish(&presence(room_id, 2));
        assert_eq!(report.dropped, 1);
        assert_eq!(report.delivered, 1);

        assert!(matches!(slow_rx.try_recv(), Ok(WsMessage::PresenceChanged { count: 1, .. })));
        assert!(slow_rx.try_recv().is_err());
        assert!(matches!(fast_rx.try_recv(), Ok(WsMessage::PresenceChanged { count: 1, .. })));
        assert!(matches!(fast_rx.try_recv(), Ok(WsMessage::PresenceChanged { count: 2, .. })));
    }

    #[tokio::test]
    async fn closed_receivers_are_reported_and_unsubscribe_ends_the_stream() {
        let room_id = Uuid::new_v4();
        let mut broker = RoomBroker::new(room_id);
        let (gone, kept) = (Uuid::new_v4(), Uuid::new_v4());
        let (gone_tx, gone_rx) = mpsc::channel(4);
        let (kept_tx, mut kept_rx) = mpsc::channel(4);
        broker.subscribe(gone, gone_tx);
        broker.subscribe(kept, kept_tx);
        drop(gone_rx);

        let report = broker.publish(&presence(room_id, 1));
        assert_eq!(report.closed, vec![gone]);

        assert!(broker.unsubscribe(kept));
        assert!(!broker.unsubscribe(kept));
        assert!(kept_rx.recv().await.is_some());
        assert!(kept_rx.recv().await.is_none());
    }
}
