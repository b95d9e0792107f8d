use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::ports::{ContentId, MetadataResult, MetadataStore};

/// Content-addressed store backed by a map.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    blobs: RwLock<HashMap<ContentId, Vec<u8>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn put(&self, bytes: Vec<u8>) -> MetadataResult<ContentId> {
        let id = ContentId::for_bytes(&bytes);
        self.blobs.write().await.entry(id.clone()).or_insert(bytes);
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> MetadataResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(id).cloned())
    }

    async fn contains(&self, id: &ContentId) -> MetadataResult<bool> {
        Ok(self.blobs.read().await.contains_key(id))
    }
}
