//! The storage adapter contract.
//!
//! A `StorageAdapter` is one live handle onto the physical resource of a
//! namespace (a database file, a keyspace file, or an in-memory map). It
//! stores named collections of JSON documents keyed by `_id`, in insertion
//! order. Backends implement five primitives; filtering, counting, grouping
//! and query-based removal are layered on top in the provided methods, since
//! no backend has native query support.

use async_trait::async_trait;
use serde_json::Value;

use crate::aggregation::Aggregation;
use crate::error::{Result, StorageError, StoreError};
use crate::query::{count_matching, execute_query, Query};
use crate::types::entity_id;

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Namespace this handle is bound to.
    fn namespace(&self) -> &str;

    /// Every document of a collection in insertion order.
    ///
    /// Fails with `CollectionNotFound` when the collection does not exist.
    async fn load(&self, collection: &str) -> Result<Vec<Value>>;

    /// Fails with `NotFound` if the id is absent.
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Value>;

    /// Insert or replace by `_id`. Existing documents keep their position.
    ///
    /// Callers guarantee `docs` is non-empty and every document has an id.
    async fn upsert(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>>;

    /// Remove one document. Fails with `NotFound` if the id is absent.
    async fn remove_by_id(&self, collection: &str, id: &str) -> Result<usize>;

    /// Destroy the whole physical resource of the namespace, all collections.
    async fn clear(&self) -> Result<()>;

    // -----------------------------------------------------------------------
    // Provided layers
    // -----------------------------------------------------------------------

    /// All documents matching `query`; empty when the collection is missing.
    async fn find(&self, collection: &str, query: Option<&Query>) -> Result<Vec<Value>> {
        let docs = match self.load(collection).await {
            Ok(docs) => docs,
            Err(StoreError::Storage(StorageError::CollectionNotFound(_))) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        match query {
            Some(q) => execute_query(docs, q),
            None => Ok(docs),
        }
    }

    async fn count(&self, collection: &str, query: Option<&Query>) -> Result<usize> {
        let docs = self.find(collection, None).await?;
        match query {
            Some(q) => count_matching(&docs, q),
            None => Ok(docs.len()),
        }
    }

    async fn group(&self, collection: &str, aggregation: &Aggregation) -> Result<Vec<Value>> {
        let docs = self.find(collection, None).await?;
        aggregation.process(docs)
    }

    /// Upsert one document and echo it back.
    async fn save(&self, collection: &str, doc: Value) -> Result<Value> {
        let mut saved = self.save_many(collection, vec![doc]).await?;
        saved
            .pop()
            .ok_or_else(|| StoreError::Internal(format!("save into {collection} returned nothing")))
    }

    /// Upsert a list. An empty list is a no-op that never touches storage.
    async fn save_many(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        if docs.iter().any(|d| entity_id(d).is_none()) {
            return Err(StorageError::MissingId {
                collection: collection.to_string(),
            }
            .into());
        }
        self.upsert(collection, docs).await
    }

    /// Resolve `query` against `find`, then remove each match by id.
    /// Returns the documents removed.
    async fn remove(&self, collection: &str, query: Option<&Query>) -> Result<Vec<Value>> {
        let matched = self.find(collection, query).await?;
        let mut removed = Vec::with_capacity(matched.len());
        for doc in matched {
            let Some(id) = entity_id(&doc) else {
                continue;
            };
            match self.remove_by_id(collection, id).await {
                Ok(_) => removed.push(doc),
                // Removed concurrently between find and delete.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}
