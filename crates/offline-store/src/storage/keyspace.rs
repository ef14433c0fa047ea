//! Single-keyspace durable adapter.
//!
//! One JSON file per namespace, `<root>/<namespace>.kv.json`, mapping each
//! collection name to its encoded document list. The file is read lazily on
//! first access and rewritten in full after every mutation (write to a temp
//! file, then rename).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::codec::{decode_documents, encode_documents};
use crate::error::{Result, StorageError, StoreError};

use super::adapter::StorageAdapter;
use super::memory::{not_found, DocumentTable};

const FILE_SUFFIX: &str = "kv.json";

type Keyspace = HashMap<String, DocumentTable>;

pub struct KeyspaceAdapter {
    namespace: String,
    path: PathBuf,
    /// `None` until the file has been read.
    state: Mutex<Option<Keyspace>>,
}

impl KeyspaceAdapter {
    pub fn new(root: &Path, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let path = root.join(format!("{namespace}.{FILE_SUFFIX}"));
        Self {
            namespace,
            path,
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The root directory must be creatable and writable.
    pub async fn is_supported(root: &Path) -> bool {
        if tokio::fs::create_dir_all(root).await.is_err() {
            return false;
        }
        let probe = root.join(".keyspace-probe");
        if tokio::fs::write(&probe, b"ok").await.is_err() {
            return false;
        }
        let _ = tokio::fs::remove_file(&probe).await;
        true
    }

    async fn read_file(&self) -> Result<Keyspace> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Keyspace::new()),
            Err(e) => return Err(e.into()),
        };
        let encoded: HashMap<String, String> = serde_json::from_str(&raw).map_err(|e| {
            StoreError::from(StorageError::Corruption {
                collection: "*".to_string(),
                id: self.namespace.clone(),
                source: Box::new(e),
            })
        })?;

        let mut keyspace = Keyspace::with_capacity(encoded.len());
        for (collection, docs) in encoded {
            let docs = decode_documents(&collection, &docs)?;
            keyspace.insert(collection, DocumentTable::from_documents(docs));
        }
        Ok(keyspace)
    }

    async fn write_file(&self, keyspace: &Keyspace) -> Result<()> {
        let mut encoded = HashMap::with_capacity(keyspace.len());
        for (collection, table) in keyspace {
            encoded.insert(collection.as_str(), encode_documents(&table.documents())?);
        }
        let raw = serde_json::to_string(&encoded)
            .map_err(|e| StoreError::Internal(format!("encode keyspace: {e}")))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Run `op` against the loaded keyspace, reading the file first if needed.
    async fn with_keyspace<T>(&self, op: impl FnOnce(&mut Keyspace) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(self.read_file().await?);
        }
        match state.as_mut() {
            Some(keyspace) => op(keyspace),
            None => Err(StoreError::Internal("keyspace not loaded".to_string())),
        }
    }

    /// Like `with_keyspace`, then persist the result. In-memory state is
    /// rolled back if the write fails.
    async fn mutate<T>(&self, op: impl FnOnce(&mut Keyspace) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(self.read_file().await?);
        }
        let Some(keyspace) = state.as_mut() else {
            return Err(StoreError::Internal("keyspace not loaded".to_string()));
        };
        let snapshot = keyspace.clone();
        let out = op(keyspace)?;
        if let Err(e) = self.write_file(keyspace).await {
            *keyspace = snapshot;
            return Err(e);
        }
        Ok(out)
    }
}

#[async_trait]
impl StorageAdapter for KeyspaceAdapter {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn load(&self, collection: &str) -> Result<Vec<Value>> {
        self.with_keyspace(|ks| {
            ks.get(collection)
                .map(DocumentTable::documents)
                .ok_or_else(|| StorageError::CollectionNotFound(collection.to_string()).into())
        })
        .await
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Value> {
        self.with_keyspace(|ks| {
            ks.get(collection)
                .and_then(|table| table.get(id).cloned())
                .ok_or_else(|| not_found(collection, id))
        })
        .await
    }

    async fn upsert(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>> {
        self.mutate(|ks| {
            let table = ks.entry(collection.to_string()).or_default();
            for doc in &docs {
                table.upsert(doc.clone());
            }
            Ok(())
        })
        .await?;
        Ok(docs)
    }

    async fn remove_by_id(&self, collection: &str, id: &str) -> Result<usize> {
        self.mutate(|ks| {
            ks.get_mut(collection)
                .and_then(|table| table.remove(id))
                .map(|_| 1)
                .ok_or_else(|| not_found(collection, id))
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        *state = Some(Keyspace::new());
        Ok(())
    }
}
