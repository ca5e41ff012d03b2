//! In-memory broker backend for tests and single-process development.
//!
//! Faithful to the facade contract: keyed partitioning, durable group
//! offsets, one unacked delivery per partition, redelivery when a delivery
//! is dropped without an ack.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use super::broker::{
    partition_for, BrokerRecord, ChannelAcker, Delivery, MessageBroker, StreamSpec, Subscription,
};
use crate::types::StorageError;

#[derive(Default)]
struct PartitionLog {
    records: parking_lot::Mutex<Vec<(String, Bytes)>>,
    appended: Notify,
}

struct GroupRuntime {
    tx: mpsc::Sender<Delivery>,
    shared_rx: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    members: AtomicUsize,
    pumps_started: AtomicBool,
}

struct TopicState {
    partitions: Vec<Arc<PartitionLog>>,
    groups: DashMap<String, Arc<GroupRuntime>>,
}

/// In-memory partitioned broker.
pub struct MemoryBroker {
    partitions: u32,
    topics: DashMap<String, Arc<TopicState>>,
    connected: AtomicBool,
    shutdown: Arc<Notify>,
    disconnect_slot: Mutex<()>,
}

impl MemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            topics: DashMap::new(),
            connected: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            disconnect_slot: Mutex::new(()),
        }
    }

    fn topic(&self, name: &str) -> Arc<TopicState> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(TopicState {
                    partitions: (0..self.partitions)
                        .map(|_| Arc::new(PartitionLog::default()))
                        .collect(),
                    groups: DashMap::new(),
                })
            })
            .clone()
    }

    fn group(&self, topic: &Arc<TopicState>, name: &str) -> Arc<GroupRuntime> {
        topic
            .groups
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.partitions as usize);
                Arc::new(GroupRuntime {
                    tx,
                    shared_rx: Arc::new(Mutex::new(rx)),
                    members: AtomicUsize::new(0),
                    pumps_started: AtomicBool::new(false),
                })
            })
            .clone()
    }

    fn start_pumps(&self, topic_name: &str, topic: &Arc<TopicState>, group: &Arc<GroupRuntime>) {
        if group.pumps_started.swap(true, Ordering::SeqCst) {
            return;
        }
        for (partition, log) in topic.partitions.iter().enumerate() {
            let log = Arc::clone(log);
            let tx = group.tx.clone();
            let shutdown = Arc::clone(&self.shutdown);
            let topic_name = topic_name.to_string();
            tokio::spawn(async move {
                let mut offset = 0usize;
                loop {
                    // Register for the append signal before checking the log
                    // so a concurrent publish cannot be missed.
                    let appended = log.appended.notified();
                    tokio::pin!(appended);
                    appended.as_mut().enable();
                    let next = log.records.lock().get(offset).cloned();
                    let (key, value) = match next {
                        Some(pair) => pair,
                        None => {
                            tokio::select! {
                                _ = appended => continue,
                                _ = shutdown.notified() => return,
                            }
                        }
                    };
                    let (done_tx, done_rx) = oneshot::channel();
                    let delivery = Delivery::new(
                        topic_name.clone(),
                        partition as u32,
                        BrokerRecord::new(key, value),
                        Box::new(ChannelAcker { done: done_tx }),
                    );
                    if tx.send(delivery).await.is_err() {
                        return;
                    }
                    // Block the partition until the delivery is acked; a
                    // dropped delivery redelivers the same offset.
                    if done_rx.await.is_ok() {
                        offset += 1;
                    }
                }
            });
        }
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn connect(&self) -> Result<(), StorageError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        let _slot = self.disconnect_slot.lock().await;
        if self.connected.swap(false, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ensure_streams(&self, specs: &[StreamSpec]) -> Result<(), StorageError> {
        for spec in specs {
            for topic in &spec.topics {
                self.topic(topic);
            }
        }
        Ok(())
    }

    async fn send(&self, topic: &str, records: Vec<BrokerRecord>) -> Result<(), StorageError> {
        if !self.is_connected() {
            return Err(StorageError::NotConnected);
        }
        let state = self.topic(topic);
        for record in records {
            let partition = partition_for(&record.key, self.partitions) as usize;
            let log = &state.partitions[partition];
            log.records.lock().push((record.key, record.value));
            log.appended.notify_waiters();
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, StorageError> {
        if !self.is_connected() {
            return Err(StorageError::NotConnected);
        }
        let state = self.topic(topic);
        let runtime = self.group(&state, group);
        runtime.members.fetch_add(1, Ordering::SeqCst);
        self.start_pumps(topic, &state, &runtime);
        Ok(Subscription::new(Arc::clone(&runtime.shared_rx)))
    }

    async fn wait_for_groups_ready(
        &self,
        topic: &str,
        groups: &[&str],
        min_members: usize,
        timeout: Duration,
    ) -> Result<(), StorageError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.topic(topic);
            let ready = groups.iter().all(|g| {
                state
                    .groups
                    .get(*g)
                    .map(|r| r.members.load(Ordering::SeqCst) >= min_members)
                    .unwrap_or(false)
            });
            if ready {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StorageError::Timeout(format!(
                    "groups {groups:?} on '{topic}' not ready within {timeout:?}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preserves_per_key_order() {
        let broker = MemoryBroker::new(4);
        broker.connect().await.unwrap();
        for i in 0..5u8 {
            broker
                .send(
                    "t",
                    vec![BrokerRecord::new("session-1", vec![i])],
                )
                .await
                .unwrap();
        }
        let mut sub = broker.subscribe("t", "g").await.unwrap();
        for expected in 0..5u8 {
            let delivery = sub.next().await.unwrap();
            assert_eq!(delivery.record.value.as_ref(), &[expected]);
            delivery.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn unacked_delivery_blocks_partition() {
        let broker = MemoryBroker::new(1);
        broker.connect().await.unwrap();
        broker
            .send("t", vec![BrokerRecord::new("k", b"first".to_vec())])
            .await
            .unwrap();
        broker
            .send("t", vec![BrokerRecord::new("k", b"second".to_vec())])
            .await
            .unwrap();

        let mut sub = broker.subscribe("t", "g").await.unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.record.value.as_ref(), b"first");

        // Second delivery cannot arrive while the first is unacked.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(blocked.is_err());

        first.ack().await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(second.record.value.as_ref(), b"second");
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let broker = MemoryBroker::new(1);
        broker.connect().await.unwrap();
        broker
            .send("t", vec![BrokerRecord::new("k", b"payload".to_vec())])
            .await
            .unwrap();

        let mut sub = broker.subscribe("t", "g").await.unwrap();
        let delivery = sub.next().await.unwrap();
        drop(delivery);

        let redelivered = sub.next().await.unwrap();
        assert_eq!(redelivered.record.value.as_ref(), b"payload");
        redelivered.ack().await.unwrap();
    }

    #[tokio::test]
    async fn readiness_waits_for_members() {
        let broker = MemoryBroker::new(2);
        broker.connect().await.unwrap();
        let err = broker
            .wait_for_groups_ready("t", &["g"], 1, Duration::from_millis(60))
            .await;
        assert!(err.is_err());

        let _sub = broker.subscribe("t", "g").await.unwrap();
        broker
            .wait_for_groups_ready("t", &["g"], 1, Duration::from_millis(200))
            .await
            .unwrap();
    }
}
