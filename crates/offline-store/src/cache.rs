//! Local persistence layers built on one storage namespace.
//!
//! - [`LocalCache`]: the entity copy of one collection.
//! - [`SyncLog`]: pending mutations for that collection, one per entity id.
//! - [`QueryCache`]: last successful request time per query signature.
//!
//! All three live in the same namespace (`namespace + tag`); the sync log
//! and query cache of collection `c` use the reserved sub-collections
//! `__sync__c` and `__query__c`.

use std::sync::Arc;

use serde_json::Value;

use crate::aggregation::Aggregation;
use crate::error::{ConfigError, Result, StorageError, StoreError, SyncError};
use crate::query::{signature, Query};
use crate::remote::ResponseMeta;
use crate::storage::{Storage, StorageAdapter};
use crate::types::{entity_id, is_local, PendingMutation, QueryCacheRecord, SyncEvent};

const RESERVED_PREFIX: &str = "__";
const SYNC_PREFIX: &str = "__sync__";
const QUERY_PREFIX: &str = "__query__";

// ============================================================================
// Validation
// ============================================================================

/// Tags may contain only ASCII letters, digits and hyphens.
pub fn validate_tag(tag: &str) -> Result<()> {
    if !tag.is_empty() && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        Ok(())
    } else {
        Err(ConfigError::InvalidTag(tag.to_string()).into())
    }
}

/// User collection names: non-empty, not reserved, `[A-Za-z0-9_.-]`.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with(RESERVED_PREFIX)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidCollectionName(name.to_string()).into())
    }
}

/// Physical namespace of a (namespace, tag) pair.
pub fn database_name(namespace: &str, tag: Option<&str>) -> Result<String> {
    match tag {
        Some(tag) => {
            validate_tag(tag)?;
            Ok(format!("{namespace}{tag}"))
        }
        None => Ok(namespace.to_string()),
    }
}

// ============================================================================
// LocalCache
// ============================================================================

/// One collection inside a shared namespace handle.
#[derive(Clone)]
pub struct LocalCache {
    adapter: Arc<dyn StorageAdapter>,
    collection: String,
}

impl LocalCache {
    /// Open the cache for `collection`, validating the tag before any
    /// storage access.
    pub async fn open(
        storage: &Storage,
        namespace: &str,
        collection: &str,
        tag: Option<&str>,
    ) -> Result<Self> {
        let database = database_name(namespace, tag)?;
        validate_collection_name(collection)?;
        let adapter = storage.adapter(&database).await?;
        Ok(Self::with_adapter(adapter, collection))
    }

    /// Wrap an existing handle. The name is not validated.
    pub fn with_adapter(adapter: Arc<dyn StorageAdapter>, collection: impl Into<String>) -> Self {
        Self {
            adapter,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    /// Sibling cache in the same namespace.
    fn sibling(&self, prefix: &str) -> LocalCache {
        Self::with_adapter(
            Arc::clone(&self.adapter),
            format!("{prefix}{}", self.collection),
        )
    }

    /// Never fails for a missing collection; yields an empty list instead.
    pub async fn find(&self, query: Option<&Query>) -> Result<Vec<Value>> {
        match self.adapter.find(&self.collection, query).await {
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    pub async fn count(&self, query: Option<&Query>) -> Result<usize> {
        match self.adapter.count(&self.collection, query).await {
            Err(e) if e.is_not_found() => Ok(0),
            other => other,
        }
    }

    /// Fails with `NotFound` if absent.
    pub async fn find_by_id(&self, id: &str) -> Result<Value> {
        match self.adapter.find_by_id(&self.collection, id).await {
            Err(StoreError::Storage(StorageError::CollectionNotFound(_))) => {
                Err(StorageError::NotFound {
                    collection: self.collection.clone(),
                    id: id.to_string(),
                }
                .into())
            }
            other => other,
        }
    }

    /// `None` instead of `NotFound`.
    pub async fn get(&self, id: &str) -> Result<Option<Value>> {
        match self.find_by_id(id).await {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn group(&self, aggregation: &Aggregation) -> Result<Vec<Value>> {
        self.adapter.group(&self.collection, aggregation).await
    }

    pub async fn save(&self, doc: Value) -> Result<Value> {
        self.adapter.save(&self.collection, doc).await
    }

    pub async fn save_many(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        self.adapter.save_many(&self.collection, docs).await
    }

    /// Fails with `NotFound` if absent.
    pub async fn remove_by_id(&self, id: &str) -> Result<usize> {
        self.adapter.remove_by_id(&self.collection, id).await
    }

    /// Remove every document matching `query`; returns what was removed.
    pub async fn remove(&self, query: Option<&Query>) -> Result<Vec<Value>> {
        match self.adapter.remove(&self.collection, query).await {
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    /// Empty this collection. Other collections of the namespace are kept.
    pub async fn clear(&self, query: Option<&Query>) -> Result<usize> {
        Ok(self.remove(query).await?.len())
    }
}

// ============================================================================
// SyncLog
// ============================================================================

/// Pending mutations of one collection, keyed by entity id.
#[derive(Clone)]
pub struct SyncLog {
    cache: LocalCache,
}

impl SyncLog {
    pub fn for_cache(cache: &LocalCache) -> Self {
        Self {
            cache: cache.sibling(SYNC_PREFIX),
        }
    }

    /// Record `event` for one entity. Returns `None` when the mutation is
    /// dropped (the Delete of an entity never confirmed remotely).
    pub async fn add_mutation(
        &self,
        event: SyncEvent,
        entity: &Value,
    ) -> Result<Option<PendingMutation>> {
        let mut recorded = self.add_mutations(event, std::slice::from_ref(entity)).await?;
        Ok(recorded.pop())
    }

    /// Record `event` for every entity, replacing any earlier record for the
    /// same id. Every entity must carry an id; nothing is written otherwise.
    pub async fn add_mutations(
        &self,
        event: SyncEvent,
        entities: &[Value],
    ) -> Result<Vec<PendingMutation>> {
        let mut ids = Vec::with_capacity(entities.len());
        for entity in entities {
            let id = entity_id(entity).ok_or_else(|| SyncError::MissingId {
                collection: self.cache.collection().to_string(),
            })?;
            ids.push((id, event == SyncEvent::Delete && is_local(entity)));
        }

        let mut records = Vec::with_capacity(ids.len());
        for (id, local_delete) in ids {
            if local_delete {
                // Never reached the remote store; nothing to replay.
                self.remove(id).await?;
            } else {
                records.push(PendingMutation::new(id, event));
            }
        }
        if records.is_empty() {
            return Ok(records);
        }

        let docs = records
            .iter()
            .map(|r| {
                serde_json::to_value(r)
                    .map_err(|e| StoreError::Internal(format!("encode pending mutation: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        // Upsert by id collapses earlier records in one write.
        self.cache.save_many(docs).await?;
        Ok(records)
    }

    /// Records whose `_id` matches `query`.
    pub async fn find(&self, query: Option<&Query>) -> Result<Vec<PendingMutation>> {
        self.cache
            .find(query)
            .await?
            .into_iter()
            .map(decode_mutation)
            .collect()
    }

    pub async fn count(&self, query: Option<&Query>) -> Result<usize> {
        self.cache.count(query).await
    }

    /// Drop matching records without replaying them.
    pub async fn clear(&self, query: Option<&Query>) -> Result<usize> {
        self.cache.clear(query).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<PendingMutation>> {
        self.cache.get(id).await?.map(decode_mutation).transpose()
    }

    /// Remove the record for `id` if there is one.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        match self.cache.remove_by_id(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove `record` only if no newer mutation replaced it meanwhile.
    pub(crate) async fn remove_if_unchanged(&self, record: &PendingMutation) -> Result<bool> {
        match self.get(&record.id).await? {
            Some(current) if current.stamp == record.stamp => self.remove(&record.id).await,
            _ => Ok(false),
        }
    }

    /// Move the record stored under `from` to `to`, keeping its stamp.
    pub(crate) async fn rekey(&self, from: &str, to: &str) -> Result<Option<PendingMutation>> {
        let Some(mut current) = self.get(from).await? else {
            return Ok(None);
        };
        current.id = to.to_string();
        let doc = serde_json::to_value(&current)
            .map_err(|e| StoreError::Internal(format!("encode pending mutation: {e}")))?;
        self.cache.save(doc).await?;
        self.remove(from).await?;
        Ok(Some(current))
    }
}

fn decode_mutation(doc: Value) -> Result<PendingMutation> {
    serde_json::from_value(doc)
        .map_err(|e| StoreError::Internal(format!("decode pending mutation: {e}")))
}

// ============================================================================
// QueryCache
// ============================================================================

/// Delta cursors: when each query shape was last pulled successfully.
#[derive(Clone)]
pub struct QueryCache {
    cache: LocalCache,
}

impl QueryCache {
    pub fn for_cache(cache: &LocalCache) -> Self {
        Self {
            cache: cache.sibling(QUERY_PREFIX),
        }
    }

    /// Cursor of the last successful pull for this exact query shape.
    /// Always `None` for windowed queries.
    pub async fn last_request(&self, query: Option<&Query>) -> Result<Option<String>> {
        let Some(key) = signature(query) else {
            return Ok(None);
        };
        let Some(doc) = self.cache.get(&key).await? else {
            return Ok(None);
        };
        let record: QueryCacheRecord = serde_json::from_value(doc)
            .map_err(|e| StoreError::Internal(format!("decode query record: {e}")))?;
        Ok(Some(record.last_request))
    }

    /// Advance the cursor for `query`. A no-op for windowed queries.
    pub async fn record_successful_fetch(
        &self,
        query: Option<&Query>,
        meta: &ResponseMeta,
    ) -> Result<Option<QueryCacheRecord>> {
        let Some(key) = signature(query) else {
            return Ok(None);
        };
        let record = QueryCacheRecord {
            signature: key,
            last_request: meta.request_start.clone(),
        };
        let doc = serde_json::to_value(&record)
            .map_err(|e| StoreError::Internal(format!("encode query record: {e}")))?;
        self.cache.save(doc).await?;
        Ok(Some(record))
    }

    pub async fn count(&self) -> Result<usize> {
        self.cache.count(None).await
    }

    /// Forget every cursor.
    pub async fn clear(&self) -> Result<usize> {
        self.cache.clear(None).await
    }
}
