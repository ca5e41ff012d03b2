//! Ephemeral pub/sub facade.
//!
//! Subscribers register JSON callbacks per channel. Messages that fail to
//! parse are logged and dropped without killing the subscription; the last
//! unsubscribe on a channel removes the underlying backend subscription.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::types::StorageError;

/// Pub/sub channel names used by the pipeline.
pub fn session_updates_channel(session_id: &str) -> String {
    format!("observatory.session.{session_id}.updates")
}

pub const SESSIONS_UPDATES_CHANNEL: &str = "observatory.sessions.updates";
pub const CONSUMERS_STATUS_CHANNEL: &str = "observatory.consumers.status";

pub type Callback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Handle returned by `subscribe`; dropping it does nothing, call
/// `unsubscribe` to detach the callback.
pub struct Subscription {
    channel: String,
    id: u64,
    registry: Arc<Registry>,
}

impl Subscription {
    /// Detach this callback. When it was the channel's last subscriber the
    /// backend subscription is removed too.
    pub async fn unsubscribe(self) -> Result<(), StorageError> {
        let now_empty = self.registry.remove(&self.channel, self.id);
        if now_empty {
            self.registry.channel_closed(&self.channel).await?;
        }
        Ok(())
    }
}

struct Registry {
    callbacks: DashMap<String, Vec<(u64, Callback)>>,
    control: Option<mpsc::Sender<ControlMessage>>,
}

impl Registry {
    fn dispatch(&self, channel: &str, payload: &[u8]) {
        let parsed: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(channel, error = %e, "Dropping unparseable pub/sub message");
                return;
            }
        };
        if let Some(entry) = self.callbacks.get(channel) {
            for (_, callback) in entry.iter() {
                callback(parsed.clone());
            }
        }
    }

    fn remove(&self, channel: &str, id: u64) -> bool {
        let mut now_empty = false;
        if let Some(mut entry) = self.callbacks.get_mut(channel) {
            entry.retain(|(cb_id, _)| *cb_id != id);
            now_empty = entry.is_empty();
        }
        if now_empty {
            self.callbacks.remove(channel);
        }
        now_empty
    }

    async fn channel_closed(&self, channel: &str) -> Result<(), StorageError> {
        if let Some(control) = &self.control {
            control
                .send(ControlMessage::Unsubscribe(channel.to_string()))
                .await
                .map_err(|_| StorageError::ShuttingDown)?;
        }
        Ok(())
    }
}

enum ControlMessage {
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

/// Pub/sub capability.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn connect(&self) -> Result<(), StorageError>;
    async fn disconnect(&self) -> Result<(), StorageError>;
    fn is_connected(&self) -> bool;

    async fn publish(
        &self,
        channel: &str,
        message: &serde_json::Value,
    ) -> Result<(), StorageError>;

    async fn subscribe(
        &self,
        channel: &str,
        callback: Callback,
    ) -> Result<Subscription, StorageError>;
}

/// In-process pub/sub for tests and single-node deployments.
pub struct MemoryPubSub {
    registry: Arc<Registry>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                callbacks: DashMap::new(),
                control: None,
            }),
            next_id: AtomicU64::new(0),
            connected: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn connect(&self) -> Result<(), StorageError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        channel: &str,
        message: &serde_json::Value,
    ) -> Result<(), StorageError> {
        let bytes =
            serde_json::to_vec(message).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.registry.dispatch(channel, &bytes);
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        callback: Callback,
    ) -> Result<Subscription, StorageError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry
            .callbacks
            .entry(channel.to_string())
            .or_default()
            .push((id, callback));
        Ok(Subscription {
            channel: channel.to_string(),
            id,
            registry: Arc::clone(&self.registry),
        })
    }
}

/// Redis pub/sub backend. One background task owns the `PubSub` connection
/// and fans messages out to registered callbacks.
pub struct RedisPubSub {
    url: String,
    registry: Arc<Registry>,
    next_id: AtomicU64,
    connected: AtomicBool,
    publish_conn: tokio::sync::Mutex<Option<redis::aio::ConnectionManager>>,
}

impl RedisPubSub {
    pub async fn new(url: impl Into<String>) -> Result<Self, StorageError> {
        let url = url.into();
        let (control_tx, control_rx) = mpsc::channel(32);
        let registry = Arc::new(Registry {
            callbacks: DashMap::new(),
            control: Some(control_tx),
        });
        let this = Self {
            url: url.clone(),
            registry: Arc::clone(&registry),
            next_id: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            publish_conn: tokio::sync::Mutex::new(None),
        };
        this.spawn_listener(control_rx)?;
        Ok(this)
    }

    fn spawn_listener(
        &self,
        mut control_rx: mpsc::Receiver<ControlMessage>,
    ) -> Result<(), StorageError> {
        let url = self.url.clone();
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let client = match redis::Client::open(url.as_str()) {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!(error = %e, "Pub/sub client construction failed");
                    return;
                }
            };
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    tracing::error!(error = %e, "Pub/sub connection failed");
                    return;
                }
            };
            loop {
                // Service control traffic between reads; the message stream
                // and the subscribe calls share the connection.
                loop {
                    match control_rx.try_recv() {
                        Ok(ControlMessage::Subscribe(channel)) => {
                            if let Err(e) = pubsub.subscribe(&channel).await {
                                tracing::warn!(%channel, error = %e, "Pub/sub subscribe failed");
                            }
                        }
                        Ok(ControlMessage::Unsubscribe(channel)) => {
                            if let Err(e) = pubsub.unsubscribe(&channel).await {
                                tracing::warn!(%channel, error = %e, "Pub/sub unsubscribe failed");
                            }
                        }
                        Ok(ControlMessage::Shutdown) => return,
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => return,
                    }
                }

                let next = tokio::time::timeout(
                    std::time::Duration::from_millis(250),
                    pubsub.on_message().next(),
                )
                .await;
                match next {
                    Ok(Some(message)) => {
                        let channel = message.get_channel_name().to_string();
                        let payload: Vec<u8> = message.get_payload_bytes().to_vec();
                        registry.dispatch(&channel, &payload);
                    }
                    Ok(None) => return,
                    Err(_) => {}
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn connect(&self) -> Result<(), StorageError> {
        let mut guard = self.publish_conn.lock().await;
        if guard.is_none() {
            let client = redis::Client::open(self.url.as_str())
                .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
            let manager = redis::aio::ConnectionManager::new(client)
                .await
                .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
            *guard = Some(manager);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.connected.store(false, Ordering::SeqCst);
        self.publish_conn.lock().await.take();
        if let Some(control) = &self.registry.control {
            let _ = control.send(ControlMessage::Shutdown).await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        channel: &str,
        message: &serde_json::Value,
    ) -> Result<(), StorageError> {
        let payload =
            serde_json::to_string(message).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let mut conn = self
            .publish_conn
            .lock()
            .await
            .clone()
            .ok_or(StorageError::NotConnected)?;
        let _: redis::Value = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        callback: Callback,
    ) -> Result<Subscription, StorageError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let first_for_channel = {
            let mut entry = self
                .registry
                .callbacks
                .entry(channel.to_string())
                .or_default();
            entry.push((id, callback));
            entry.len() == 1
        };
        if first_for_channel {
            if let Some(control) = &self.registry.control {
                control
                    .send(ControlMessage::Subscribe(channel.to_string()))
                    .await
                    .map_err(|_| StorageError::ShuttingDown)?;
            }
        }
        Ok(Subscription {
            channel: channel.to_string(),
            id,
            registry: Arc::clone(&self.registry),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn callbacks_receive_parsed_json() {
        let bus = MemoryPubSub::new();
        let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let sink = Arc::clone(&seen);
        bus.subscribe(
            "observatory.sessions.updates",
            Arc::new(move |value| sink.lock().unwrap().push(value)),
        )
        .await
        .unwrap();

        bus.publish(
            "observatory.sessions.updates",
            &serde_json::json!({"type": "session_updated"}),
        )
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["type"], "session_updated");
    }

    #[tokio::test]
    async fn unsubscribe_detaches_callback() {
        let bus = MemoryPubSub::new();
        let seen: Arc<Mutex<usize>> = Arc::default();
        let sink = Arc::clone(&seen);
        let sub = bus
            .subscribe("ch", Arc::new(move |_| *sink.lock().unwrap() += 1))
            .await
            .unwrap();

        bus.publish("ch", &serde_json::json!(1)).await.unwrap();
        sub.unsubscribe().await.unwrap();
        bus.publish("ch", &serde_json::json!(2)).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn parse_errors_do_not_kill_subscription() {
        let bus = MemoryPubSub::new();
        let seen: Arc<Mutex<usize>> = Arc::default();
        let sink = Arc::clone(&seen);
        bus.subscribe("ch", Arc::new(move |_| *sink.lock().unwrap() += 1))
            .await
            .unwrap();

        // Malformed payloads go through the raw dispatch path.
        bus.registry.dispatch("ch", b"{not json");
        bus.publish("ch", &serde_json::json!({"ok": true}))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn channel_name_formatting() {
        assert_eq!(
            session_updates_channel("abc"),
            "observatory.session.abc.updates"
        );
    }
}
