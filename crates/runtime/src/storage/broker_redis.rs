//! Redis Streams broker backend.
//!
//! Each topic is sharded into `partitions` streams named `{topic}:{p}`;
//! records route to a shard by FNV hash of their key. Consumer groups map
//! onto stream groups (`XGROUP`/`XREADGROUP`/`XACK`): one pump task per
//! partition delivers a single entry at a time and re-reads its pending list
//! when a delivery is dropped, giving at-least-once with per-partition order.
//! Kafka-compatible and JetStream backends implement the same facade.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

use super::broker::{
    partition_for, Acker, BrokerRecord, Delivery, MessageBroker, Retention, StreamSpec,
    Subscription,
};
use crate::types::{now_ms, StorageError};

fn map_redis_error(e: redis::RedisError) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout(e.to_string())
    } else if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
        StorageError::ConnectionFailed(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

fn stream_key(topic: &str, partition: u32) -> String {
    format!("{topic}:{partition}")
}

struct GroupRuntime {
    shared_rx: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    members: AtomicUsize,
}

/// Redis Streams implementation of the broker facade.
pub struct RedisStreamsBroker {
    url: String,
    partitions: u32,
    manager: Mutex<Option<ConnectionManager>>,
    connected: Arc<AtomicBool>,
    retention: DashMap<String, Retention>,
    groups: DashMap<(String, String), Arc<GroupRuntime>>,
    disconnect_slot: Mutex<()>,
}

impl RedisStreamsBroker {
    pub fn new(url: impl Into<String>, partitions: u32) -> Self {
        Self {
            url: url.into(),
            partitions: partitions.max(1),
            manager: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            retention: DashMap::new(),
            groups: DashMap::new(),
            disconnect_slot: Mutex::new(()),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, StorageError> {
        self.manager
            .lock()
            .await
            .clone()
            .ok_or(StorageError::NotConnected)
    }

    async fn create_group(
        conn: &mut ConnectionManager,
        key: &str,
        group: &str,
    ) -> Result<(), StorageError> {
        let result: Result<Value, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(e)),
        }
    }

    /// Read one entry for the consumer; `from_pending` re-reads this
    /// consumer's pending list instead of new entries.
    async fn read_one(
        conn: &mut ConnectionManager,
        key: &str,
        group: &str,
        consumer: &str,
        from_pending: bool,
    ) -> Result<Option<(String, BrokerRecord)>, StorageError> {
        let id = if from_pending { "0" } else { ">" };
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(1000)
            .arg("STREAMS")
            .arg(key)
            .arg(id)
            .query_async(conn)
            .await
            .map_err(map_redis_error)?;
        Ok(parse_xread_reply(&reply))
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn as_bytes(value: &Value) -> Option<Bytes> {
    match value {
        Value::BulkString(bytes) => Some(Bytes::copy_from_slice(bytes)),
        Value::SimpleString(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
        _ => None,
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).parse().ok(),
        _ => None,
    }
}

/// Parse an XREADGROUP reply down to the first `(entry_id, record)`.
/// Handles both RESP2 nested arrays and RESP3 maps.
fn parse_xread_reply(reply: &Value) -> Option<(String, BrokerRecord)> {
    let entries = match reply {
        Value::Array(streams) => match streams.first()? {
            Value::Array(pair) => match pair.get(1)? {
                Value::Array(entries) => entries.clone(),
                _ => return None,
            },
            _ => return None,
        },
        Value::Map(streams) => match &streams.first()?.1 {
            Value::Array(entries) => entries.clone(),
            _ => return None,
        },
        _ => return None,
    };
    let entry = entries.first()?;
    let Value::Array(parts) = entry else {
        return None;
    };
    let entry_id = as_string(parts.first()?)?;
    let Value::Array(fields) = parts.get(1)? else {
        return None;
    };
    let mut key = None;
    let mut value = None;
    for chunk in fields.chunks(2) {
        let (name, field_value) = (chunk.first()?, chunk.get(1)?);
        match as_string(name)?.as_str() {
            "key" => key = as_string(field_value),
            "value" => value = as_bytes(field_value),
            _ => {}
        }
    }
    Some((entry_id, BrokerRecord::new(key?, value?)))
}

/// Parse XINFO GROUPS output into `(group_name, consumer_count)` pairs.
fn parse_group_info(reply: &Value) -> Vec<(String, usize)> {
    let Value::Array(groups) = reply else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for group in groups {
        let fields: Vec<(String, Value)> = match group {
            Value::Array(flat) => flat
                .chunks(2)
                .filter_map(|c| Some((as_string(c.first()?)?, c.get(1)?.clone())))
                .collect(),
            Value::Map(entries) => entries
                .iter()
                .filter_map(|(k, v)| Some((as_string(k)?, v.clone())))
                .collect(),
            _ => continue,
        };
        let mut name = None;
        let mut consumers = 0usize;
        for (field, value) in fields {
            match field.as_str() {
                "name" => name = as_string(&value),
                "consumers" => consumers = as_int(&value).unwrap_or(0).max(0) as usize,
                _ => {}
            }
        }
        if let Some(name) = name {
            out.push((name, consumers));
        }
    }
    out
}

struct RedisAcker {
    conn: ConnectionManager,
    key: String,
    group: String,
    entry_id: String,
    done: oneshot::Sender<()>,
}

#[async_trait]
impl Acker for RedisAcker {
    async fn ack(self: Box<Self>) -> Result<(), StorageError> {
        let mut conn = self.conn;
        let _: Value = redis::cmd("XACK")
            .arg(&self.key)
            .arg(&self.group)
            .arg(&self.entry_id)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        let _ = self.done.send(());
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for RedisStreamsBroker {
    async fn connect(&self) -> Result<(), StorageError> {
        let mut guard = self.manager.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;
        *guard = Some(manager);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(url = %self.url, partitions = self.partitions, "Redis Streams broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        let _slot = self.disconnect_slot.lock().await;
        self.connected.store(false, Ordering::SeqCst);
        self.manager.lock().await.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ensure_streams(&self, specs: &[StreamSpec]) -> Result<(), StorageError> {
        for spec in specs {
            for topic in &spec.topics {
                self.retention.insert(topic.to_string(), spec.retention);
            }
            tracing::debug!(stream = spec.name, topics = ?spec.topics, "Stream provisioned");
        }
        Ok(())
    }

    async fn send(&self, topic: &str, records: Vec<BrokerRecord>) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        let retention = self.retention.get(topic).map(|r| *r.value());
        for record in records {
            let partition = partition_for(&record.key, self.partitions);
            let key = stream_key(topic, partition);
            let mut cmd = redis::cmd("XADD");
            cmd.arg(&key).arg("*");
            cmd.arg("key").arg(&record.key);
            cmd.arg("value").arg(record.value.as_ref());
            let _: Value = cmd.query_async(&mut conn).await.map_err(map_redis_error)?;

            if let Some(Retention::Limits { max_age }) = retention {
                let min_id = format!("{}-0", now_ms() - max_age.as_millis() as i64);
                let _: Result<Value, _> = redis::cmd("XTRIM")
                    .arg(&key)
                    .arg("MINID")
                    .arg("~")
                    .arg(min_id)
                    .query_async(&mut conn)
                    .await;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, StorageError> {
        let mut conn = self.connection().await?;
        let runtime_key = (topic.to_string(), group.to_string());
        if let Some(existing) = self.groups.get(&runtime_key) {
            existing.members.fetch_add(1, Ordering::SeqCst);
            return Ok(Subscription::new(Arc::clone(&existing.shared_rx)));
        }

        let (tx, rx) = mpsc::channel(self.partitions as usize);
        let runtime = Arc::new(GroupRuntime {
            shared_rx: Arc::new(Mutex::new(rx)),
            members: AtomicUsize::new(1),
        });
        self.groups.insert(runtime_key, Arc::clone(&runtime));

        for partition in 0..self.partitions {
            let key = stream_key(topic, partition);
            Self::create_group(&mut conn, &key, group).await?;

            let pump_conn = conn.clone();
            let tx = tx.clone();
            let group = group.to_string();
            let topic = topic.to_string();
            let consumer = format!("{group}-p{partition}");
            let connected = Arc::clone(&self.connected);
            tokio::spawn(async move {
                let mut conn = pump_conn;
                // Drain our own pending entries first so a restart resumes
                // unacked work before new entries.
                let mut from_pending = true;
                while connected.load(Ordering::SeqCst) {
                    let next =
                        Self::read_one(&mut conn, &key, &group, &consumer, from_pending).await;
                    let (entry_id, record) = match next {
                        Ok(Some(found)) => found,
                        Ok(None) => {
                            from_pending = false;
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(stream = %key, error = %e, "Broker read failed, backing off");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            continue;
                        }
                    };
                    let (done_tx, done_rx) = oneshot::channel();
                    let delivery = Delivery::new(
                        topic.clone(),
                        partition,
                        record,
                        Box::new(RedisAcker {
                            conn: conn.clone(),
                            key: key.clone(),
                            group: group.clone(),
                            entry_id,
                            done: done_tx,
                        }),
                    );
                    if tx.send(delivery).await.is_err() {
                        return;
                    }
                    match done_rx.await {
                        Ok(()) => {}
                        // Dropped without an ack: re-read pending to redeliver.
                        Err(_) => from_pending = true,
                    }
                }
            });
        }
        Ok(Subscription::new(Arc::clone(&runtime.shared_rx)))
    }

    async fn wait_for_groups_ready(
        &self,
        topic: &str,
        groups: &[&str],
        min_members: usize,
        timeout: Duration,
    ) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut all_ready = true;
            'partitions: for partition in 0..self.partitions {
                let key = stream_key(topic, partition);
                let reply: Result<Value, _> =
                    redis::cmd("XINFO").arg("GROUPS").arg(&key).query_async(&mut conn).await;
                let info = match reply {
                    Ok(v) => parse_group_info(&v),
                    Err(_) => {
                        all_ready = false;
                        break 'partitions;
                    }
                };
                for group in groups {
                    let stable = info
                        .iter()
                        .any(|(name, consumers)| name == group && *consumers >= min_members);
                    if !stable {
                        all_ready = false;
                        break 'partitions;
                    }
                }
            }
            if all_ready {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StorageError::Timeout(format!(
                    "groups {groups:?} on '{topic}' not STABLE within {timeout:?}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_resp2_xread_reply() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("events.raw:0"),
            Value::Array(vec![Value::Array(vec![
                bulk("1700000000000-0"),
                Value::Array(vec![
                    bulk("key"),
                    bulk("session-1"),
                    bulk("value"),
                    bulk("{\"x\":1}"),
                ]),
            ])]),
        ])]);
        let (id, record) = parse_xread_reply(&reply).unwrap();
        assert_eq!(id, "1700000000000-0");
        assert_eq!(record.key, "session-1");
        assert_eq!(record.value.as_ref(), b"{\"x\":1}");
    }

    #[test]
    fn empty_reply_yields_none() {
        assert!(parse_xread_reply(&Value::Nil).is_none());
        assert!(parse_xread_reply(&Value::Array(vec![])).is_none());
    }

    #[test]
    fn parses_group_info_pairs() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("name"),
            bulk("parser"),
            bulk("consumers"),
            Value::Int(2),
            bulk("pending"),
            Value::Int(0),
        ])]);
        let info = parse_group_info(&reply);
        assert_eq!(info, vec![("parser".to_string(), 2)]);
    }
}
