//! Content-addressed metadata store port.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("Metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Hex-encoded sha-256 of the stored bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ContentId(String);

impl ContentId {
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store keyed by content hash; writing the same bytes twice yields the same id.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> MetadataResult<ContentId>;

    async fn get(&self, id: &ContentId) -> MetadataResult<Option<Vec<u8>>>;

    async fn contains(&self, id: &ContentId) -> MetadataResult<bool> {
        Ok(self.get(id).await?.is_some())
    }
}

/// JSON helpers over any [`MetadataStore`].
#[async_trait]
pub trait MetadataStoreExt: MetadataStore {
    async fn put_json<T: Serialize + Sync>(&self, value: &T) -> MetadataResult<ContentId> {
        let bytes = serde_json::to_vec(value)?;
        self.put(bytes).await
    }

    async fn get_json<T: DeserializeOwned + Send>(&self, id: &ContentId) -> MetadataResult<Option<T>> {
        match self.get(id).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<S: MetadataStore + ?Sized> MetadataStoreExt for S {}
