//! The Subscription Registry (spec §4.2): `channel -> set<connection>` with
//! best-effort, at-most-once delivery and dead-connection reaping.

use std::sync::atomic;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use dashmap::DashMap;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::jsonrpc::JsonRpcNotification;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Ack,
    AlreadySubscribed,
}

/// A live connection's outbound queue, grounded on the teacher's per-socket
/// `flume::Sender<Message>` used for subscription pushes. Bounded: a slow
/// subscriber is disconnected rather than buffered indefinitely (spec §5).
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    sender: flume::Sender<Message>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sender: flume::Sender<Message>) -> Self {
        Self { id, sender }
    }

    fn try_send(&self, msg: Message) -> bool {
        match self.sender.try_send(msg) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => false,
            Err(flume::TrySendError::Disconnected(_)) => false,
        }
    }

    /// Queues a direct reply (e.g. a `subscribe` ack) on the same outbound
    /// queue used for published events, preserving per-connection ordering.
    pub fn send_text(&self, text: String) -> bool {
        self.try_send(Message::Text(text))
    }

    /// Queues a close frame ahead of the connection being torn down (spec
    /// §5, server shutdown). Best-effort: a full queue just means the
    /// socket closes without this frame, which is fine since the drain
    /// loop is about to drop it anyway.
    pub fn send_close(&self, code: u16, reason: &'static str) -> bool {
        self.try_send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
    }
}

/// Maps channel names to the connections subscribed to them, and tracks
/// the reverse mapping so a dropped connection can be unsubscribed from
/// everything in O(channels-it-joined).
pub struct SubscriptionRegistry {
    by_channel: DashMap<String, DashMap<ConnectionId, ConnectionHandle>>,
    by_connection: DashMap<ConnectionId, Vec<String>>,
    known_channels: Vec<String>,
}

impl SubscriptionRegistry {
    pub fn new(known_channels: Vec<String>) -> Self {
        Self {
            by_channel: DashMap::new(),
            by_connection: DashMap::new(),
            known_channels,
        }
    }

    fn channel_known(&self, channel: &str) -> bool {
        self.known_channels.iter().any(|c| c == channel)
    }

    /// Registers a connection that just opened. Must be called before any
    /// `subscribe` for that connection.
    pub fn register_connection(&self, conn: ConnectionId) {
        self.by_connection.entry(conn).or_default();
    }

    pub fn subscribe(&self, conn: ConnectionHandle, channel: &str) -> Result<SubscribeOutcome, String> {
        if !self.channel_known(channel) {
            return Err(format!("Channel {channel} does not exist"));
        }

        let bucket = self.by_channel.entry(channel.to_string()).or_default();

        let outcome = if bucket.contains_key(&conn.id) {
            SubscribeOutcome::AlreadySubscribed
        } else {
            bucket.insert(conn.id, conn.clone());
            SubscribeOutcome::Ack
        };
        drop(bucket);

        let mut joined = self.by_connection.entry(conn.id).or_default();
        if !joined.contains(&channel.to_string()) {
            joined.push(channel.to_string());
        }

        Ok(outcome)
    }

    /// Idempotent: unsubscribing from a channel never joined is a no-op.
    pub fn unsubscribe(&self, conn: ConnectionId, channel: &str) {
        if let Some(bucket) = self.by_channel.get(channel) {
            bucket.remove(&conn);
        }

        if let Some(mut joined) = self.by_connection.get_mut(&conn) {
            joined.retain(|c| c != channel);
        }
    }

    /// Drops a connection from every channel it was subscribed to. Called
    /// on WS close/error (spec §4.1 "on error or close, unregister and
    /// drop all subscriptions").
    pub fn drop_connection(&self, conn: ConnectionId) {
        if let Some((_, channels)) = self.by_connection.remove(&conn) {
            for channel in channels {
                if let Some(bucket) = self.by_channel.get(&channel) {
                    bucket.remove(&conn);
                }
            }
        }
    }

    /// Delivers `data` to every live subscriber of `channel`, in
    /// publication order for that channel. Connections whose send fails
    /// (full or disconnected queue) are dropped from all channels --- a
    /// failure on one connection never affects delivery to others.
    pub fn publish(&self, channel: &str, data: serde_json::Value) {
        let Some(bucket) = self.by_channel.get(channel) else {
            return;
        };

        let notification = JsonRpcNotification::subscription(channel.to_string(), data);
        let encoded = serde_json::to_string(&notification).expect("notification always serializes");
        let msg = Message::Text(encoded);

        let mut dead = Vec::new();
        for entry in bucket.iter() {
            if !entry.value().try_send(msg.clone()) {
                dead.push(*entry.key());
            }
        }
        drop(bucket);

        for conn in dead {
            warn!(%conn, %channel, "dropping slow or disconnected subscriber");
            self.drop_connection(conn);
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.by_channel.get(channel).map(|b| b.len()).unwrap_or(0)
    }

    /// Periodic sweep (spec §4.2, every 5s) removing connections whose
    /// sender has disconnected but that haven't been touched by a publish
    /// since.
    pub fn reap_dead_connections(&self) {
        let mut dead = Vec::new();
        for entry in self.by_connection.iter() {
            let conn = *entry.key();
            let is_dead = self
                .by_channel
                .iter()
                .filter_map(|bucket| bucket.get(&conn).map(|h| h.sender.is_disconnected()))
                .any(|disconnected| disconnected);

            if is_dead {
                dead.push(conn);
            }
        }

        for conn in dead {
            trace!(%conn, "reaping dead connection");
            self.drop_connection(conn);
        }
    }

    pub async fn run_reaper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.reap_dead_connections();
        }
    }
}

pub static NEXT_SUBSCRIPTION_ID: atomic::AtomicU64 = atomic::AtomicU64::new(1);

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(vec!["ORDER".into(), "TRADE".into()])
    }

    fn handle() -> (ConnectionHandle, flume::Receiver<Message>) {
        let (tx, rx) = flume::bounded(8);
        (ConnectionHandle::new(Uuid::new_v4(), tx), rx)
    }

    #[test]
    fn subscribe_to_unknown_channel_is_rejected() {
        let reg = registry();
        let (conn, _rx) = handle();
        reg.register_connection(conn.id);
        assert_eq!(reg.subscribe(conn, "UNKNOWN"), Err("Channel UNKNOWN does not exist".to_string()));
    }

    #[test]
    fn duplicate_subscribe_is_ack_not_error() {
        let reg = registry();
        let (conn, _rx) = handle();
        reg.register_connection(conn.id);
        assert_eq!(reg.subscribe(conn.clone(), "ORDER"), Ok(SubscribeOutcome::Ack));
        assert_eq!(
            reg.subscribe(conn, "ORDER"),
            Ok(SubscribeOutcome::AlreadySubscribed)
        );
        assert_eq!(reg.subscriber_count("ORDER"), 1);
    }

    #[test]
    fn subscribe_then_unsubscribe_is_net_zero() {
        let reg = registry();
        let (conn, _rx) = handle();
        reg.register_connection(conn.id);
        reg.subscribe(conn.clone(), "ORDER").unwrap();
        reg.unsubscribe(conn.id, "ORDER");
        assert_eq!(reg.subscriber_count("ORDER"), 0);
    }

    #[test]
    fn unsubscribe_from_unjoined_channel_is_noop() {
        let reg = registry();
        let (conn, _rx) = handle();
        reg.register_connection(conn.id);
        reg.unsubscribe(conn.id, "TRADE");
        assert_eq!(reg.subscriber_count("TRADE"), 0);
    }

    #[test]
    fn publish_delivers_only_to_subscribed_channel() {
        let reg = registry();
        let (conn, rx) = handle();
        reg.register_connection(conn.id);
        reg.subscribe(conn, "ORDER").unwrap();

        reg.publish("ORDER", serde_json::json!({"status": "OPEN"}));
        reg.publish("TRADE", serde_json::json!({"trade_id": "t1"}));

        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn drop_connection_removes_from_all_channels() {
        let reg = registry();
        let (conn, _rx) = handle();
        reg.register_connection(conn.id);
        reg.subscribe(conn.clone(), "ORDER").unwrap();
        reg.subscribe(conn.clone(), "TRADE").unwrap();

        reg.drop_connection(conn.id);

        assert_eq!(reg.subscriber_count("ORDER"), 0);
        assert_eq!(reg.subscriber_count("TRADE"), 0);
    }

    #[test]
    fn full_queue_disconnects_subscriber_without_affecting_others() {
        let reg = registry();
        let (slow_conn, slow_rx) = handle();
        let (fast_conn, fast_rx) = handle();
        reg.register_connection(slow_conn.id);
        reg.register_connection(fast_conn.id);
        reg.subscribe(slow_conn.clone(), "ORDER").unwrap();
        reg.subscribe(fast_conn, "ORDER").unwrap();

        // fill the slow connection's bounded queue (capacity 8) past its
        // limit while draining the fast one after every publish, so only
        // the slow connection ever backs up
        for i in 0..9 {
            reg.publish("ORDER", serde_json::json!({"i": i}));
            fast_rx.try_recv().unwrap();
        }

        assert_eq!(reg.subscriber_count("ORDER"), 1);
        assert!(slow_rx.len() <= 8);
        assert!(fast_rx.is_empty());
    }
}
