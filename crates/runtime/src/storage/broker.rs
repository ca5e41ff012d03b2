//! Partition-ordered message broker facade.
//!
//! Topics are partitioned by a string key; all records sharing a key land on
//! one partition, which preserves per-session order end to end. Consumers
//! join durable groups and acknowledge each delivery explicitly; an unacked
//! delivery blocks its partition, which is the pipeline's back-pressure
//! mechanism.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::types::StorageError;

pub const TOPIC_EVENTS_RAW: &str = "events.raw";
pub const TOPIC_EVENTS_PARSED: &str = "events.parsed";
pub const TOPIC_TURNS_FINALIZED: &str = "memory.turns.finalized";
pub const TOPIC_NODES_CREATED: &str = "memory.nodes.created";
pub const DLQ_INGESTION: &str = "dlq.ingestion";
pub const DLQ_MEMORY: &str = "dlq.memory";

/// Retention policy for a logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Keep records up to `max_age`.
    Limits { max_age: Duration },
    /// Keep records until consumed and acknowledged.
    WorkQueue,
}

/// A logical stream grouping one or more topics under a retention policy.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub name: &'static str,
    pub topics: Vec<&'static str>,
    pub retention: Retention,
}

/// The three streams every deployment provisions.
pub fn standard_streams() -> Vec<StreamSpec> {
    vec![
        StreamSpec {
            name: "EVENTS",
            topics: vec![TOPIC_EVENTS_RAW, TOPIC_EVENTS_PARSED],
            retention: Retention::Limits {
                max_age: Duration::from_secs(24 * 3600),
            },
        },
        StreamSpec {
            name: "MEMORY",
            topics: vec![TOPIC_TURNS_FINALIZED, TOPIC_NODES_CREATED],
            retention: Retention::WorkQueue,
        },
        StreamSpec {
            name: "DLQ",
            topics: vec![DLQ_INGESTION, DLQ_MEMORY],
            retention: Retention::Limits {
                max_age: Duration::from_secs(7 * 24 * 3600),
            },
        },
    ]
}

/// FNV-1a partition assignment. Stable across processes and restarts.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % u64::from(partitions.max(1))) as u32
}

/// A keyed record on a topic.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub key: String,
    pub value: Bytes,
}

impl BrokerRecord {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Acknowledgement handle completing one delivery.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<(), StorageError>;
}

/// One consumed record plus its ack handle.
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub record: BrokerRecord,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(topic: String, partition: u32, record: BrokerRecord, acker: Box<dyn Acker>) -> Self {
        Self {
            topic,
            partition,
            record,
            acker: Some(acker),
        }
    }

    /// Acknowledge the delivery, unblocking the partition. Dropping the
    /// delivery without acking leads to redelivery.
    pub async fn ack(mut self) -> Result<(), StorageError> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("key", &self.record.key)
            .finish()
    }
}

/// A consumer-group membership. Members of the same group compete for
/// partitions; each partition delivers one unacked record at a time.
pub struct Subscription {
    shared_rx: std::sync::Arc<Mutex<mpsc::Receiver<Delivery>>>,
}

impl Subscription {
    pub fn new(shared_rx: std::sync::Arc<Mutex<mpsc::Receiver<Delivery>>>) -> Self {
        Self { shared_rx }
    }

    /// Next delivery for this group, or `None` once the broker shuts down.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.shared_rx.lock().await.recv().await
    }
}

/// Oneshot-backed ack used by in-process backends.
pub struct ChannelAcker {
    pub done: oneshot::Sender<()>,
}

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(self: Box<Self>) -> Result<(), StorageError> {
        // The pump treats a dropped sender as a nack; sending marks success.
        let _ = self.done.send(());
        Ok(())
    }
}

/// Message broker capability.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn connect(&self) -> Result<(), StorageError>;
    async fn disconnect(&self) -> Result<(), StorageError>;
    fn is_connected(&self) -> bool;

    /// Provision streams and their retention. Idempotent.
    async fn ensure_streams(&self, specs: &[StreamSpec]) -> Result<(), StorageError>;

    /// Publish records, each routed by its key's partition.
    async fn send(&self, topic: &str, records: Vec<BrokerRecord>) -> Result<(), StorageError>;

    /// Join a durable consumer group on a topic.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, StorageError>;

    /// Wait until the named groups exist on the topic with at least
    /// `min_members` members each, polling within `timeout`.
    async fn wait_for_groups_ready(
        &self,
        topic: &str,
        groups: &[&str],
        min_members: usize,
        timeout: Duration,
    ) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitioning_is_stable_and_in_range() {
        let p1 = partition_for("session-a", 8);
        let p2 = partition_for("session-a", 8);
        assert_eq!(p1, p2);
        assert!(p1 < 8);
        // Single partition degenerates without panicking.
        assert_eq!(partition_for("anything", 1), 0);
    }

    #[test]
    fn standard_streams_cover_all_topics() {
        let specs = standard_streams();
        let topics: Vec<&str> = specs.iter().flat_map(|s| s.topics.clone()).collect();
        for t in [
            TOPIC_EVENTS_RAW,
            TOPIC_EVENTS_PARSED,
            TOPIC_TURNS_FINALIZED,
            TOPIC_NODES_CREATED,
            DLQ_INGESTION,
            DLQ_MEMORY,
        ] {
            assert!(topics.contains(&t), "missing {t}");
        }
    }
}
