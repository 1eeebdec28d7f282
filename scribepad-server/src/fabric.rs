//! Cross-instance fan-out: per-document channels on an opaque pub/sub bus,
//! plus the local room membership each instance keeps for its own sessions.
//!
//! Every accepted delta is published to the document's channel; a
//! per-document demultiplexer task on each subscribed instance forwards it
//! to local room members (excluding the originating session) and keeps the
//! local engine replica following the authoritative sequence.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::Identifier;
use crate::engine::Engine;
use crate::ot::Operation;
use crate::session::ServerMsg;

const BUS_CAPACITY: usize = 256;

/// The shared message broker, treated as opaque publish/subscribe with
/// FIFO order per channel and at-least-once delivery.
pub trait Bus: Send + Sync + 'static {
    /// Publish a payload to every current subscriber of `channel`.
    fn publish(&self, channel: &str, payload: Bytes);
    /// Subscribe to a channel's stream of payloads.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Bytes>;
}

/// In-process bus backed by one broadcast channel per document. Instances
/// in one process (or one test) share a single `MemoryBus` handle; a
/// production cluster substitutes a broker-backed implementation.
#[derive(Default)]
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
}

impl MemoryBus {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Bus for MemoryBus {
    fn publish(&self, channel: &str, payload: Bytes) {
        let sender = self.channels.get(channel).map(|entry| entry.value().clone());
        if let Some(sender) = sender
            && sender.send(payload).is_err()
        {
            // Last subscriber is gone; let the channel be rebuilt on demand.
            self.channels
                .remove_if(channel, |_, sender| sender.receiver_count() == 0);
        }
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .subscribe()
    }
}

/// A message crossing the bus, JSON-encoded into the opaque payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusEvent {
    /// An accepted, transformed operation set and the version it produced.
    Delta {
        doc: Identifier,
        ops: Vec<Operation>,
        version: u64,
        origin_instance: u64,
        origin_session: u64,
        origin_user: Identifier,
        at_ms: u64,
    },
    /// A participant left the document's room somewhere in the cluster.
    UserLeft {
        doc: Identifier,
        origin_instance: u64,
        origin_session: u64,
        user_id: Identifier,
        username: String,
    },
}

impl BusEvent {
    /// Serialize for the wire.
    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("bus event serializes"))
    }

    /// Parse a payload received from the bus.
    pub fn decode(payload: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Handle the engine uses to enqueue accepted deltas onto the document's
/// channel from inside its critical section, so deltas hit the bus in
/// version order.
pub struct Publisher {
    bus: Arc<dyn Bus>,
    instance_id: u64,
}

impl Publisher {
    /// A publisher stamping messages with this instance's identity.
    pub fn new(bus: Arc<dyn Bus>, instance_id: u64) -> Self {
        Self { bus, instance_id }
    }

    /// Enqueue an accepted delta. Non-blocking.
    pub fn delta(
        &self,
        doc: &Identifier,
        ops: &[Operation],
        version: u64,
        origin_session: u64,
        origin_user: &Identifier,
    ) {
        self.bus.publish(
            doc.as_ref(),
            BusEvent::Delta {
                doc: doc.clone(),
                ops: ops.to_vec(),
                version,
                origin_instance: self.instance_id,
                origin_session,
                origin_user: origin_user.clone(),
                at_ms: now_ms(),
            }
            .encode(),
        );
    }
}

/// Milliseconds since the Unix epoch, for bus timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn from_ms(ms: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_millis(ms)
}

/// One local participant of a room.
pub struct Member {
    /// User identity from the handshake.
    pub user_id: Identifier,
    /// Display name from the handshake.
    pub username: String,
    tx: mpsc::UnboundedSender<ServerMsg>,
}

/// Per-instance membership of one document: session id to outbound queue.
#[derive(Default)]
pub struct Room {
    members: DashMap<u64, Member>,
}

impl Room {
    /// Register a session's outbound queue.
    pub fn join(
        &self,
        session: u64,
        user_id: Identifier,
        username: String,
        tx: mpsc::UnboundedSender<ServerMsg>,
    ) {
        self.members.insert(
            session,
            Member {
                user_id,
                username,
                tx,
            },
        );
    }

    /// Remove a session, returning its membership if it was present.
    pub fn leave(&self, session: u64) -> Option<Member> {
        self.members.remove(&session).map(|(_, member)| member)
    }

    /// Whether no local session is joined.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of local participants.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Queue `msg` to every member except `except`.
    pub fn broadcast_except(&self, except: Option<u64>, msg: &ServerMsg) {
        for entry in &self.members {
            if Some(*entry.key()) == except {
                continue;
            }
            // A closed queue means the session is tearing down; it will
            // remove itself from the room.
            entry.value().tx.send(msg.clone()).ok();
        }
    }
}

/// Per-document subscriber: forwards bus traffic for one channel to the
/// local room until the engine is killed.
///
/// The caller subscribes before spawning this task so no delta published
/// after the join reply can be missed.
pub async fn demux(
    engine: Arc<Engine>,
    room: Arc<Room>,
    mut updates: broadcast::Receiver<Bytes>,
    instance_id: u64,
) {
    loop {
        tokio::select! {
            _ = engine.kill_notified() => break,
            next = updates.recv() => match next {
                Ok(payload) => deliver(&engine, &room, instance_id, &payload).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(document = %engine.id(), skipped, "bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn deliver(engine: &Engine, room: &Room, instance_id: u64, payload: &[u8]) {
    let event = match BusEvent::decode(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(document = %engine.id(), "undecodable bus payload: {e}");
            return;
        }
    };
    match event {
        BusEvent::Delta {
            ops,
            version,
            origin_instance,
            origin_session,
            at_ms,
            ..
        } => {
            if origin_instance != instance_id {
                engine
                    .apply_remote(&ops, version, origin_session, from_ms(at_ms))
                    .await;
            }
            let except = (origin_instance == instance_id).then_some(origin_session);
            room.broadcast_except(
                except,
                &ServerMsg::ReceiveChanges {
                    ops,
                    version,
                    origin: origin_session,
                },
            );
        }
        BusEvent::UserLeft {
            origin_instance,
            origin_session,
            user_id,
            username,
            ..
        } => {
            let except = (origin_instance == instance_id).then_some(origin_session);
            room.broadcast_except(except, &ServerMsg::UserLeft { user_id, username });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_per_channel_in_order() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("doc-a");
        let mut b = bus.subscribe("doc-b");

        bus.publish("doc-a", Bytes::from_static(b"1"));
        bus.publish("doc-a", Bytes::from_static(b"2"));
        bus.publish("doc-b", Bytes::from_static(b"3"));

        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"1"));
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"2"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"3"));
    }

    #[tokio::test]
    async fn bus_reaches_every_subscriber() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe("doc");
        let mut second = bus.subscribe("doc");

        bus.publish("doc", Bytes::from_static(b"x"));
        assert_eq!(first.recv().await.unwrap(), Bytes::from_static(b"x"));
        assert_eq!(second.recv().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn room_broadcast_skips_the_origin() {
        let room = Room::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        room.join(1, "alice".parse().unwrap(), "Alice".into(), tx1);
        room.join(2, "bob".parse().unwrap(), "Bob".into(), tx2);

        room.broadcast_except(
            Some(1),
            &ServerMsg::UserLeft {
                user_id: "carol".parse().unwrap(),
                username: "Carol".into(),
            },
        );
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn bus_event_round_trips() {
        let event = BusEvent::Delta {
            doc: "doc".parse().unwrap(),
            ops: vec![Operation::insert(0, "hi")],
            version: 3,
            origin_instance: 7,
            origin_session: 1,
            origin_user: "alice".parse().unwrap(),
            at_ms: now_ms(),
        };
        let decoded = BusEvent::decode(&event.encode()).unwrap();
        match decoded {
            BusEvent::Delta { version, ops, .. } => {
                assert_eq!(version, 3);
                assert_eq!(ops, vec![Operation::insert(0, "hi")]);
            }
            _ => panic!("wrong variant"),
        }
    }
}
