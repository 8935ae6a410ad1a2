//! Topic-addressed messaging channel shared by session-sync nodes.
//!
//! The bus is deliberately dumb: it moves opaque payloads between subscribers of a
//! topic. Framing lives in [`Envelope`], which tags each payload with a kind so a
//! single topic can carry several message shapes.

use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// In-process bus. Every node attached to the same `LocalBus` sees every message,
/// including its own.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    /// Publishing to a topic nobody listens on is not an error; the message is dropped.
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic);
        if sender.receiver_count() == 0 {
            return Ok(());
        }
        sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::Closed)
    }
}

/// JSON frame carried on the bus: `{"type": <kind>, "payload": <T>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(kind: impl Into<String>, payload: T) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn encode(&self) -> BusResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Encode and publish in one step.
    pub fn publish_on(&self, bus: &dyn Bus, topic: &str) -> BusResult<()> {
        bus.publish(topic, self.encode()?)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    pub fn decode(payload: &[u8]) -> BusResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_delivers_to_every_subscriber() {
        let bus = LocalBus::new();
        let mut first = bus.subscribe("session-sync.snapshot");
        let mut second = bus.subscribe("session-sync.snapshot");
        bus.publish("session-sync.snapshot", Bytes::from_static(b"ping"))
            .expect("publish ok");

        for sub in [&mut first, &mut second] {
            let msg = sub.recv().await.expect("receive ok");
            assert_eq!(msg.topic, "session-sync.snapshot");
            assert_eq!(msg.payload, Bytes::from_static(b"ping"));
        }
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = LocalBus::new();
        bus.publish("nobody.listens", Bytes::from_static(b"x"))
            .expect("publish without subscribers");
    }

    #[tokio::test]
    async fn envelope_travels_over_bus() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("session-sync.heartbeat");
        Envelope::new("heartbeat", serde_json::json!({"host_id": "host-1"}))
            .publish_on(&bus, "session-sync.heartbeat")
            .expect("publish");

        let msg = sub.recv().await.expect("recv");
        let env: Envelope<serde_json::Value> = Envelope::decode(&msg.payload).expect("decode");
        assert_eq!(env.kind, "heartbeat");
        assert_eq!(env.payload["host_id"], "host-1");
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Envelope::<serde_json::Value>::decode(b"not json").unwrap_err();
        assert!(matches!(err, BusError::Codec(_)));
    }
}
