//! Store configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::storage::StorageProvider;
use crate::types::{AutoPagination, SyncOptions};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub storage: StorageConfig,
    pub sync: SyncConfig,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the durable backends' files.
    pub root: PathBuf,
    /// Providers probed in order; the first supported one is used.
    pub providers: Vec<StorageProvider>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            providers: vec![
                StorageProvider::Sqlite,
                StorageProvider::Keyspace,
                StorageProvider::Memory,
            ],
        }
    }
}

/// Push/pull defaults, used when a call's [`SyncOptions`] leaves a flag unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Pending mutations replayed concurrently per push batch (default: 100).
    pub push_batch_size: usize,
    /// Page size for auto-paginated pulls (default: 10 000).
    pub page_size: usize,
    pub auto_sync: bool,
    pub use_delta_set: bool,
    pub auto_pagination: bool,
    /// Remote calls exceeding this fail with a timeout error.
    pub remote_timeout_ms: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_batch_size: 100,
            page_size: 10_000,
            auto_sync: false,
            use_delta_set: false,
            auto_pagination: false,
            remote_timeout_ms: None,
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./offline-store")
}

impl StoreConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(s).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.push_batch_size == 0 {
            return Err(ConfigError::InvalidOption(
                "sync.push_batch_size must be a positive number".to_string(),
            )
            .into());
        }
        if self.sync.page_size == 0 {
            return Err(ConfigError::InvalidOption(
                "sync.page_size must be a positive number".to_string(),
            )
            .into());
        }
        if self.storage.providers.is_empty() {
            return Err(ConfigError::InvalidOption(
                "storage.providers must name at least one provider".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// [`SyncOptions`] with every flag resolved against the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedOptions {
    pub auto_sync: bool,
    pub use_delta_set: bool,
    /// `Some(page_size)` when auto-pagination is on.
    pub page_size: Option<usize>,
    pub push_first: bool,
}

impl SyncConfig {
    pub(crate) fn resolve(&self, options: &SyncOptions) -> ResolvedOptions {
        let pagination = options
            .auto_pagination
            .unwrap_or(AutoPagination::from(self.auto_pagination));
        let page_size = match pagination {
            AutoPagination::Disabled => None,
            AutoPagination::Enabled => Some(self.page_size),
            AutoPagination::PageSize(0) => Some(self.page_size),
            AutoPagination::PageSize(n) => Some(n),
        };
        ResolvedOptions {
            auto_sync: options.auto_sync.unwrap_or(self.auto_sync),
            use_delta_set: options.use_delta_set.unwrap_or(self.use_delta_set),
            page_size,
            push_first: options.push_first.unwrap_or(false),
        }
    }

    pub(crate) fn remote_timeout(&self) -> Option<Duration> {
        self.remote_timeout_ms.map(Duration::from_millis)
    }
}
