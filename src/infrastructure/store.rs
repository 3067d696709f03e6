use crate::domain::records::{BusinessKey, Fields, Record};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt document: {0}")]
    Corrupt(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub key: BusinessKey,
    pub fields: Fields,
}

/// Idempotent persistence primitives keyed by business key.
///
/// `upsert` merges fields into an existing document (last write wins per
/// field) and `conditional_insert` must be atomic: it only succeeds when no
/// document with that key exists.
#[async_trait]
pub trait DownstreamStore: Send + Sync {
    async fn upsert(
        &self,
        collection: &str,
        key: &BusinessKey,
        fields: Fields,
    ) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, key: &BusinessKey) -> Result<Option<Fields>, StoreError>;

    async fn conditional_insert(
        &self,
        collection: &str,
        key: &BusinessKey,
        fields: Fields,
    ) -> Result<bool, StoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, collection: &str, key: &BusinessKey) -> Result<(), StoreError>;

    /// Atomically deletes the document only if its fields contain every entry
    /// of `expected`. Returns whether a document was deleted.
    async fn delete_if(
        &self,
        collection: &str,
        key: &BusinessKey,
        expected: &Fields,
    ) -> Result<bool, StoreError>;

    /// Atomically adds `delta` to the integer `field` (missing counts as 0),
    /// creating the document if needed. Returns the new value.
    async fn increment(
        &self,
        collection: &str,
        key: &BusinessKey,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError>;

    /// Documents whose fields equal every entry of `filter`.
    async fn query(&self, collection: &str, filter: &Fields) -> Result<Vec<Document>, StoreError>;
}

pub fn matches_filter(fields: &Fields, filter: &Fields) -> bool {
    filter
        .iter()
        .all(|(name, expected)| fields.get(name) == Some(expected))
}

pub async fn upsert_record<R: Record + Sync>(
    store: &dyn DownstreamStore,
    record: &R,
) -> Result<(), StoreError> {
    store
        .upsert(R::COLLECTION, &record.key(), record.to_fields()?)
        .await
}

pub async fn get_record<T: DeserializeOwned>(
    store: &dyn DownstreamStore,
    collection: &str,
    key: &BusinessKey,
) -> Result<Option<T>, StoreError> {
    match store.get(collection, key).await? {
        Some(fields) => Ok(Some(serde_json::from_value(Value::Object(fields))?)),
        None => Ok(None),
    }
}

/// Process-local store used for tests and single-node runs.
#[derive(Default)]
pub struct MemoryStore {
    documents: DashMap<(String, BusinessKey), Fields>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.documents
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DownstreamStore for MemoryStore {
    async fn upsert(
        &self,
        collection: &str,
        key: &BusinessKey,
        fields: Fields,
    ) -> Result<(), StoreError> {
        self.documents
            .entry((collection.to_string(), key.clone()))
            .or_default()
            .extend(fields);
        Ok(())
    }

    async fn get(&self, collection: &str, key: &BusinessKey) -> Result<Option<Fields>, StoreError> {
        Ok(self
            .documents
            .get(&(collection.to_string(), key.clone()))
            .map(|entry| entry.value().clone()))
    }

    async fn conditional_insert(
        &self,
        collection: &str,
        key: &BusinessKey,
        fields: Fields,
    ) -> Result<bool, StoreError> {
        match self.documents.entry((collection.to_string(), key.clone())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(fields);
                Ok(true)
            }
        }
    }

    async fn delete(&self, collection: &str, key: &BusinessKey) -> Result<(), StoreError> {
        self.documents.remove(&(collection.to_string(), key.clone()));
        Ok(())
    }

    async fn delete_if(
        &self,
        collection: &str,
        key: &BusinessKey,
        expected: &Fields,
    ) -> Result<bool, StoreError> {
        let removed = self
            .documents
            .remove_if(&(collection.to_string(), key.clone()), |_, fields| {
                matches_filter(fields, expected)
            });
        Ok(removed.is_some())
    }

    async fn increment(
        &self,
        collection: &str,
        key: &BusinessKey,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let mut document = self
            .documents
            .entry((collection.to_string(), key.clone()))
            .or_default();
        let value = document.get(field).and_then(Value::as_i64).unwrap_or(0) + delta;
        document.insert(field.to_string(), Value::from(value));
        Ok(value)
    }

    async fn query(&self, collection: &str, filter: &Fields) -> Result<Vec<Document>, StoreError> {
        let mut documents: Vec<Document> = self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == collection && matches_filter(entry.value(), filter))
            .map(|entry| Document {
                key: entry.key().1.clone(),
                fields: entry.value().clone(),
            })
            .collect();
        documents.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(documents)
    }
}

/// Store wrappers that force concurrent callers to overlap.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum GatedOp {
        Get,
        ConditionalInsert,
    }

    /// Parks the first `parties` calls of one operation on one collection at
    /// a barrier right after the call has run, so every caller has done that
    /// step before any of them moves on.
    pub(crate) struct GatedStore {
        pub(crate) inner: MemoryStore,
        op: GatedOp,
        collection: &'static str,
        barrier: Barrier,
        remaining: AtomicUsize,
    }

    impl GatedStore {
        pub(crate) fn new(op: GatedOp, collection: &'static str, parties: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                op,
                collection,
                barrier: Barrier::new(parties),
                remaining: AtomicUsize::new(parties),
            }
        }

        async fn pass(&self, op: GatedOp, collection: &str) {
            if op != self.op || collection != self.collection {
                return;
            }
            let admitted = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if admitted {
                self.barrier.wait().await;
            }
        }
    }

    #[async_trait]
    impl DownstreamStore for GatedStore {
        async fn upsert(
            &self,
            collection: &str,
            key: &BusinessKey,
            fields: Fields,
        ) -> Result<(), StoreError> {
            self.inner.upsert(collection, key, fields).await
        }

        async fn get(
            &self,
            collection: &str,
            key: &BusinessKey,
        ) -> Result<Option<Fields>, StoreError> {
            let read = self.inner.get(collection, key).await;
            self.pass(GatedOp::Get, collection).await;
            read
        }

        async fn conditional_insert(
            &self,
            collection: &str,
            key: &BusinessKey,
            fields: Fields,
        ) -> Result<bool, StoreError> {
            let inserted = self.inner.conditional_insert(collection, key, fields).await;
            self.pass(GatedOp::ConditionalInsert, collection).await;
            inserted
        }

        async fn delete(&self, collection: &str, key: &BusinessKey) -> Result<(), StoreError> {
            self.inner.delete(collection, key).await
        }

        async fn delete_if(
            &self,
            collection: &str,
            key: &BusinessKey,
            expected: &Fields,
        ) -> Result<bool, StoreError> {
            self.inner.delete_if(collection, key, expected).await
        }

        async fn increment(
            &self,
            collection: &str,
            key: &BusinessKey,
            field: &str,
            delta: i64,
        ) -> Result<i64, StoreError> {
            self.inner.increment(collection, key, field, delta).await
        }

        async fn query(
            &self,
            collection: &str,
            filter: &Fields,
        ) -> Result<Vec<Document>, StoreError> {
            self.inner.query(collection, filter).await
        }
    }
}
