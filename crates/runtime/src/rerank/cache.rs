//! Singleton model cache keyed by `(model, quantization)`.
//!
//! Loads coalesce: concurrent requests for the same key share one in-flight
//! load. Every access refreshes a last-used stamp; entries idle past the
//! timeout are unloaded by `evict_idle`, which the runtime calls on an
//! interval.

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::CrossEncoder;
use crate::types::RerankError;

pub type ModelKey = (String, String);
pub type ModelLoader =
    Arc<dyn Fn(&str, &str) -> BoxFuture<'static, Result<Arc<dyn CrossEncoder>, RerankError>> + Send + Sync>;

struct Entry {
    model: Arc<dyn CrossEncoder>,
    last_used: SyncMutex<Instant>,
}

pub struct ModelCache {
    entries: DashMap<ModelKey, Arc<Entry>>,
    /// Per-key load slots; loads for the same key coalesce here.
    loading: DashMap<ModelKey, Arc<Mutex<()>>>,
    loader: ModelLoader,
    idle_timeout: Duration,
}

impl ModelCache {
    pub fn new(loader: ModelLoader, idle_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            loading: DashMap::new(),
            loader,
            idle_timeout,
        }
    }

    /// Fetch the model, loading it once if absent.
    pub async fn get(
        &self,
        model: &str,
        quantization: &str,
    ) -> Result<Arc<dyn CrossEncoder>, RerankError> {
        let key = (model.to_string(), quantization.to_string());
        if let Some(entry) = self.entries.get(&key) {
            *entry.last_used.lock() = Instant::now();
            return Ok(Arc::clone(&entry.model));
        }

        let slot = self
            .loading
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = slot.lock().await;

        // Another waiter may have completed the load while we queued.
        if let Some(entry) = self.entries.get(&key) {
            *entry.last_used.lock() = Instant::now();
            return Ok(Arc::clone(&entry.model));
        }

        tracing::info!(model, quantization, "Loading reranker model");
        let loaded = (self.loader)(model, quantization).await?;
        self.entries.insert(
            key.clone(),
            Arc::new(Entry {
                model: Arc::clone(&loaded),
                last_used: SyncMutex::new(Instant::now()),
            }),
        );
        self.loading.remove(&key);
        Ok(loaded)
    }

    /// Unload entries idle past the timeout; returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let timeout = self.idle_timeout;
        let before = self.entries.len();
        self.entries
            .retain(|key, entry| {
                let keep = entry.last_used.lock().elapsed() < timeout;
                if !keep {
                    tracing::info!(model = %key.0, quantization = %key.1, "Unloading idle reranker model");
                }
                keep
            });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rerank::MockCrossEncoder;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_loader(counter: Arc<AtomicU32>) -> ModelLoader {
        Arc::new(move |model, _quant| {
            let counter = Arc::clone(&counter);
            let model = model.to_string();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(MockCrossEncoder::new(model)) as Arc<dyn CrossEncoder>)
            })
        })
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_load() {
        let counter = Arc::new(AtomicU32::new(0));
        let cache = Arc::new(ModelCache::new(
            counting_loader(Arc::clone(&counter)),
            Duration::from_secs(300),
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get("fast-ce", "int8").await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn distinct_quantizations_load_separately() {
        let counter = Arc::new(AtomicU32::new(0));
        let cache = ModelCache::new(counting_loader(Arc::clone(&counter)), Duration::from_secs(300));
        cache.get("m", "int8").await.unwrap();
        cache.get("m", "fp16").await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_entries_unload() {
        let counter = Arc::new(AtomicU32::new(0));
        let cache = ModelCache::new(counting_loader(counter), Duration::from_millis(0));
        cache.get("m", "int8").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.evict_idle(), 1);
        assert!(cache.is_empty());
    }
}
