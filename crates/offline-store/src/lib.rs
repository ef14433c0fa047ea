pub mod error;
pub mod types;

pub mod aggregation;
pub mod cache;
pub mod codec;
pub mod config;
pub mod query;
pub mod remote;
pub mod storage;
pub mod sync;

pub use cache::{LocalCache, QueryCache, SyncLog};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use storage::{Storage, StorageAdapter, StorageProvider};
pub use sync::SyncCoordinator;
