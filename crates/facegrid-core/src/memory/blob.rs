//! In-memory blob store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{PipelineError, PipelineResult};
use crate::memory::lock;
use crate::service::BlobStore;

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Bytes>>,
    unavailable: AtomicBool,
}

impl MemoryBlobStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.objects).contains_key(key)
    }

    /// Direct read, bypassing the availability switch.
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> PipelineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::Blob("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> PipelineResult<()> {
        self.check_available()?;
        lock(&self.objects).insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> PipelineResult<Bytes> {
        self.check_available()?;
        lock(&self.objects)
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::BlobNotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let store = MemoryBlobStore::new();
        store.put("photo.jpg", Bytes::from_static(b"img")).await.unwrap();
        assert_eq!(store.get("photo.jpg").await.unwrap(), Bytes::from_static(b"img"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn put_overwrites() {
        let store = MemoryBlobStore::new();
        store.put("photo", Bytes::from_static(b"alice")).await.unwrap();
        store.put("photo", Bytes::from_static(b"bob")).await.unwrap();
        assert_eq!(store.peek("photo").unwrap(), Bytes::from_static(b"bob"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let store = MemoryBlobStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, PipelineError::BlobNotFound(k) if k == "nope"));
    }

    #[tokio::test]
    async fn unavailable_store_fails_calls() {
        let store = MemoryBlobStore::new();
        store.set_unavailable(true);
        assert!(store.put("k", Bytes::new()).await.is_err());
        assert!(store.is_empty());

        store.set_unavailable(false);
        assert!(store.put("k", Bytes::new()).await.is_ok());
    }
}
