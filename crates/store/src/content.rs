//! Content-addressed blob store interface and typed cache on top of it.

use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

/// Content id for `data`: hex blake3 digest.
pub fn content_id(data: &[u8]) -> String { blake3::hash(data).to_hex().to_string() }

/// Narrow interface over an external content-addressed store.
/// Ids are immutable: callers never rewrite an existing id's content.
#[async_trait::async_trait]
pub trait ContentStore: Send + Sync {
    async fn push(&self, data: Bytes) -> Result<String>;
    async fn get(&self, cid: &str) -> Result<Bytes>;
}

#[derive(Default)]
pub struct MemoryContentStore {
    blobs: RwLock<FxHashMap<String, Bytes>>,
}

impl MemoryContentStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.blobs.read().map(|m| m.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait::async_trait]
impl ContentStore for MemoryContentStore {
    async fn push(&self, data: Bytes) -> Result<String> {
        let cid = content_id(&data);
        let mut map = self.blobs.write().map_err(|_| anyhow!("content store lock poisoned"))?;
        map.entry(cid.clone()).or_insert(data);
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> Result<Bytes> {
        let map = self.blobs.read().map_err(|_| anyhow!("content store lock poisoned"))?;
        map.get(cid).cloned().ok_or_else(|| anyhow!("content {cid} not found"))
    }
}

/// JSON push/get over a [`ContentStore`].
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn ContentStore>,
}

impl Cache {
    pub fn new(store: Arc<dyn ContentStore>) -> Self { Self { store } }

    pub fn store(&self) -> &Arc<dyn ContentStore> { &self.store }

    pub async fn push<T: Serialize + ?Sized>(&self, obj: &T) -> Result<String> {
        let started = std::time::Instant::now();
        let data = serde_json::to_vec(obj).context("encoding cache object")?;
        let cid = self.store.push(Bytes::from(data)).await.context("pushing to content store")?;
        histogram!("cache_push_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("cache_push_total", 1u64);
        debug!(cid = %cid, "cache: push ok");
        Ok(cid)
    }

    pub async fn get<T: DeserializeOwned>(&self, cid: &str) -> Result<T> {
        let started = std::time::Instant::now();
        let data = self.store.get(cid).await.with_context(|| format!("fetching {cid}"))?;
        let out = serde_json::from_slice(&data).with_context(|| format!("decoding {cid}"))?;
        histogram!("cache_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn push_get_roundtrip_and_dedup() {
        let store = Arc::new(MemoryContentStore::new());
        let cache = Cache::new(store.clone());
        let a = cache.push(&json!({"name": "x"})).await.unwrap();
        let b = cache.push(&json!({"name": "x"})).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        let back: Value = cache.get(&a).await.unwrap();
        assert_eq!(back["name"], "x");
    }

    #[tokio::test]
    async fn missing_cid_errors() {
        let cache = Cache::new(Arc::new(MemoryContentStore::new()));
        let err = cache.get::<Value>("nope").await.unwrap_err();
        assert!(format!("{err:#}").contains("not found"));
    }
}
