//! Key-value document storage for read models and checkpoints.
//!
//! Projections write their read models as JSON documents keyed by string.
//! The typed helpers ([`load_document`], [`save_document`],
//! [`update_document`]) do the serde conversion around the raw
//! [`DocumentStore`] calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::DocumentError;

/// Storage for JSON documents keyed by string.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the document stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Transport`] if the store is unreachable.
    async fn get(&self, key: &str) -> Result<Option<Value>, DocumentError>;

    /// Insert or replace the document stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Transport`] if the store is unreachable.
    async fn put(&self, key: &str, document: Value) -> Result<(), DocumentError>;

    /// Remove the document stored under `key`. Removing a missing key is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Transport`] if the store is unreachable.
    async fn delete(&self, key: &str) -> Result<(), DocumentError>;
}

/// A [`DocumentStore`] held in memory.
///
/// Clones share the same documents.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    documents: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl InMemoryDocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys starting with `prefix`, in order.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.documents
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Whether the store holds no documents.
    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, DocumentError> {
        Ok(self.documents.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, document: Value) -> Result<(), DocumentError> {
        self.documents.write().await.insert(key.to_string(), document);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DocumentError> {
        self.documents.write().await.remove(key);
        Ok(())
    }
}

/// Load and decode the document stored under `key`.
///
/// # Errors
///
/// Returns [`DocumentError::Codec`] if the stored document does not match `T`.
pub async fn load_document<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    key: &str,
) -> Result<Option<T>, DocumentError> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| DocumentError::Codec {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Encode `document` and store it under `key`.
///
/// # Errors
///
/// Returns [`DocumentError::Codec`] if `document` cannot be serialized.
pub async fn save_document<T: Serialize + Sync>(
    store: &dyn DocumentStore,
    key: &str,
    document: &T,
) -> Result<(), DocumentError> {
    let value = serde_json::to_value(document).map_err(|source| DocumentError::Codec {
        key: key.to_string(),
        source,
    })?;
    store.put(key, value).await
}

/// Read-modify-write the document under `key`.
///
/// Returns `false` without writing when no document exists. Projections use
/// this for updates that only make sense once the creation event has been
/// projected.
///
/// # Errors
///
/// Returns [`DocumentError`] if loading, decoding or saving fails.
pub async fn update_document<T, F>(
    store: &dyn DocumentStore,
    key: &str,
    f: F,
) -> Result<bool, DocumentError>
where
    T: Serialize + DeserializeOwned + Send + Sync,
    F: FnOnce(&mut T) + Send,
{
    let Some(mut document) = load_document::<T>(store, key).await? else {
        return Ok(false);
    };
    f(&mut document);
    save_document(store, key, &document).await?;
    Ok(true)
}
