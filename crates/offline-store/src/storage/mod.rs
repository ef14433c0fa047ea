pub mod adapter;
pub mod keyspace;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::config::StorageConfig;
use crate::error::{ConfigError, Result, StorageError};

pub use adapter::StorageAdapter;
pub use keyspace::KeyspaceAdapter;
pub use memory::MemoryAdapter;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteAdapter, TransactionStats};

// ============================================================================
// StorageProvider
// ============================================================================

/// Physical backend kinds, probed in configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    /// Durable multi-collection database (one SQLite file per namespace).
    Sqlite,
    /// Durable single-keyspace store (one JSON file per namespace).
    Keyspace,
    /// Volatile in-memory map.
    Memory,
}

impl StorageProvider {
    /// Runtime capability probe.
    pub async fn is_supported(self, root: &Path) -> bool {
        match self {
            #[cfg(feature = "sqlite")]
            StorageProvider::Sqlite => SqliteAdapter::is_supported(root),
            #[cfg(not(feature = "sqlite"))]
            StorageProvider::Sqlite => false,
            StorageProvider::Keyspace => KeyspaceAdapter::is_supported(root).await,
            StorageProvider::Memory => MemoryAdapter::is_supported(),
        }
    }

    /// Create a handle for `namespace`. Does not probe.
    pub fn open(self, root: &Path, namespace: &str) -> Result<Arc<dyn StorageAdapter>> {
        Ok(match self {
            #[cfg(feature = "sqlite")]
            StorageProvider::Sqlite => Arc::new(SqliteAdapter::new(root, namespace)),
            #[cfg(not(feature = "sqlite"))]
            StorageProvider::Sqlite => return Err(StorageError::NoSupportedProvider.into()),
            StorageProvider::Keyspace => Arc::new(KeyspaceAdapter::new(root, namespace)),
            StorageProvider::Memory => Arc::new(MemoryAdapter::new(namespace)),
        })
    }
}

// ============================================================================
// Storage registry
// ============================================================================

/// Process-wide registry of namespace handles.
///
/// Every cache scoped to the same namespace shares one adapter instance, so
/// all of them contend on the same transaction queue. Different namespaces
/// get independent handles.
pub struct Storage {
    config: StorageConfig,
    handles: Mutex<HashMap<String, Arc<dyn StorageAdapter>>>,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Registry backed only by the volatile provider.
    pub fn in_memory() -> Self {
        Self::new(StorageConfig {
            providers: vec![StorageProvider::Memory],
            ..StorageConfig::default()
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Shared handle for `namespace`, opened with the first supported provider.
    pub async fn adapter(&self, namespace: &str) -> Result<Arc<dyn StorageAdapter>> {
        validate_namespace(namespace)?;
        let existing = self.handles.lock().get(namespace).cloned();
        if let Some(handle) = existing {
            return Ok(handle);
        }

        let provider = self.select_provider().await?;
        let opened = provider.open(&self.config.root, namespace)?;

        // Another task may have opened the namespace while we probed.
        let mut handles = self.handles.lock();
        let handle = handles
            .entry(namespace.to_string())
            .or_insert_with(|| {
                tracing::debug!(namespace, ?provider, "opened storage namespace");
                opened
            });
        Ok(Arc::clone(handle))
    }

    async fn select_provider(&self) -> Result<StorageProvider> {
        for provider in &self.config.providers {
            if provider.is_supported(&self.config.root).await {
                return Ok(*provider);
            }
            tracing::debug!(?provider, "storage provider not supported, trying next");
        }
        Err(StorageError::NoSupportedProvider.into())
    }

    /// Destroy every collection of `namespace`.
    ///
    /// The handle stays registered: caches opened before the clear keep
    /// sharing it with caches opened after.
    pub async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        let handle = self.adapter(namespace).await?;
        handle.clear().await?;
        tracing::debug!(namespace, "cleared storage namespace");
        Ok(())
    }
}

/// Namespaces become file names, so they follow the collection-name rules.
fn validate_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !namespace.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidCollectionName(namespace.to_string()).into())
    }
}
