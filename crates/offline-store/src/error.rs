use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Entity not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Document in {collection} has no _id")]
    MissingId { collection: String },

    #[error("Collection \"{0}\" does not exist")]
    CollectionNotFound(String),

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Storage corruption in {collection}/{id}")]
    Corruption {
        collection: String,
        id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("No storage provider is supported in this environment")]
    NoSupportedProvider,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid tag \"{0}\": tags may contain only letters, digits and hyphens")]
    InvalidTag(String),

    #[error("Invalid collection name \"{0}\"")]
    InvalidCollectionName(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error(transparent)]
    Parse(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// Classification of failures reported by a remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Connection-level failure.
    Network,
    /// The call did not complete within the configured timeout.
    Timeout,
    /// The entity or collection does not exist remotely.
    NotFound,
    /// The backend rejected the request.
    Rejected,
    /// The backend cannot serve a delta set for this query.
    DeltaSetUnavailable,
}

/// Failure returned by a [`RemoteStore`](crate::remote::RemoteStore) call.
///
/// `debug` carries the backend-provided detail verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    pub debug: Option<String>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            debug: None,
        }
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::new(
            RemoteErrorKind::Timeout,
            format!("Remote request timed out after {after_ms}ms"),
        )
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Remote error ({:?}): {}", self.kind, self.message)?;
        if let Some(debug) = &self.debug {
            write!(f, " [{debug}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

// ---------------------------------------------------------------------------
// QueryError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Invalid regex: {0}")]
    InvalidRegex(String),
}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(
        "Unable to pull {collection}: {count} pending mutation(s) must be pushed first"
    )]
    DirtyState { collection: String, count: usize },

    #[error("Entity in {collection} has no _id and cannot be tracked for sync")]
    MissingId { collection: String },

    #[error("Entity {collection}/{id} is pending sync but missing from the local cache")]
    MissingEntity { collection: String, id: String },
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// True for an absent entity or collection, locally or remotely.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::Storage(StorageError::NotFound { .. })
                | StoreError::Storage(StorageError::CollectionNotFound(_))
                | StoreError::Remote(RemoteError {
                    kind: RemoteErrorKind::NotFound,
                    ..
                })
        )
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage(StorageError::Sqlite(e))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Storage(StorageError::Io(e))
    }
}

/// Crate result alias; the error defaults to `StoreError`.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
