//! Volatile in-memory adapter.
//!
//! Data lives only as long as the adapter. Interior mutability via
//! `parking_lot::Mutex`; no lock is held across an await point.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Result, StorageError};
use crate::types::entity_id;

use super::adapter::StorageAdapter;

// ============================================================================
// DocumentTable
// ============================================================================

/// Insertion-ordered documents with id lookup.
///
/// Replacing a document keeps its original position.
#[derive(Debug, Default, Clone)]
pub(crate) struct DocumentTable {
    next_seq: u64,
    /// insertion sequence → document
    docs: BTreeMap<u64, Value>,
    /// id → insertion sequence
    ids: HashMap<String, u64>,
}

impl DocumentTable {
    pub(crate) fn from_documents(docs: Vec<Value>) -> Self {
        let mut table = Self::default();
        for doc in docs {
            table.upsert(doc);
        }
        table
    }

    /// Documents without an id are ignored.
    pub(crate) fn upsert(&mut self, doc: Value) {
        let Some(id) = entity_id(&doc).map(str::to_string) else {
            return;
        };
        match self.ids.get(&id) {
            Some(seq) => {
                self.docs.insert(*seq, doc);
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.ids.insert(id, seq);
                self.docs.insert(seq, doc);
            }
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Value> {
        self.ids.get(id).and_then(|seq| self.docs.get(seq))
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Value> {
        let seq = self.ids.remove(id)?;
        self.docs.remove(&seq)
    }

    pub(crate) fn documents(&self) -> Vec<Value> {
        self.docs.values().cloned().collect()
    }
}

// ============================================================================
// MemoryAdapter
// ============================================================================

pub struct MemoryAdapter {
    namespace: String,
    collections: Mutex<HashMap<String, DocumentTable>>,
}

impl MemoryAdapter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// Always available.
    pub fn is_supported() -> bool {
        true
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn load(&self, collection: &str) -> Result<Vec<Value>> {
        self.collections
            .lock()
            .get(collection)
            .map(DocumentTable::documents)
            .ok_or_else(|| StorageError::CollectionNotFound(collection.to_string()).into())
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Value> {
        self.collections
            .lock()
            .get(collection)
            .and_then(|table| table.get(id).cloned())
            .ok_or_else(|| not_found(collection, id))
    }

    async fn upsert(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut collections = self.collections.lock();
        let table = collections.entry(collection.to_string()).or_default();
        for doc in &docs {
            table.upsert(doc.clone());
        }
        Ok(docs)
    }

    async fn remove_by_id(&self, collection: &str, id: &str) -> Result<usize> {
        self.collections
            .lock()
            .get_mut(collection)
            .and_then(|table| table.remove(id))
            .map(|_| 1)
            .ok_or_else(|| not_found(collection, id))
    }

    async fn clear(&self) -> Result<()> {
        self.collections.lock().clear();
        Ok(())
    }
}

pub(crate) fn not_found(collection: &str, id: &str) -> crate::error::StoreError {
    StorageError::NotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
    .into()
}
