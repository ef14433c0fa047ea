use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RemoteError;

// ============================================================================
// Entity fields
// ============================================================================

/// Identifier field of every entity and bookkeeping record.
pub const ID_FIELD: &str = "_id";
/// Metadata sub-record of an entity.
pub const KMD_FIELD: &str = "_kmd";
/// `_kmd.local`: the id was generated on this device and never confirmed remotely.
pub const LOCAL_FIELD: &str = "local";
/// `_kmd.lmt`: RFC 3339 last-modified timestamp.
pub const LMT_FIELD: &str = "lmt";

/// Read the `_id` of a document, if it is a non-empty string.
pub fn entity_id(doc: &Value) -> Option<&str> {
    doc.get(ID_FIELD)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// True if `_kmd.local` is set on the document.
pub fn is_local(doc: &Value) -> bool {
    doc.get(KMD_FIELD)
        .and_then(|kmd| kmd.get(LOCAL_FIELD))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Mutable access to the `_kmd` object, creating it when absent.
///
/// Returns `None` if `doc` itself is not an object.
pub(crate) fn kmd_mut(doc: &mut Value) -> Option<&mut Map<String, Value>> {
    let obj = doc.as_object_mut()?;
    let kmd = obj
        .entry(KMD_FIELD.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !kmd.is_object() {
        *kmd = Value::Object(Map::new());
    }
    kmd.as_object_mut()
}

/// Remove `_id` and `_kmd.local`, leaving the rest of the document intact.
pub(crate) fn strip_local_identity(doc: &mut Value) {
    if let Some(obj) = doc.as_object_mut() {
        obj.remove(ID_FIELD);
        if let Some(kmd) = obj.get_mut(KMD_FIELD).and_then(Value::as_object_mut) {
            kmd.remove(LOCAL_FIELD);
            if kmd.is_empty() {
                obj.remove(KMD_FIELD);
            }
        }
    }
}

// ============================================================================
// Pending mutations
// ============================================================================

/// Kind of local write awaiting replay against the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncEvent {
    Create,
    Update,
    Delete,
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::Create => write!(f, "Create"),
            SyncEvent::Update => write!(f, "Update"),
            SyncEvent::Delete => write!(f, "Delete"),
        }
    }
}

/// Sync Log record. Keyed by the entity id, so at most one exists per entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMutation {
    #[serde(rename = "_id")]
    pub id: String,
    pub event: SyncEvent,
    /// Unique per recording; lets push detect a mutation recorded mid-flight.
    pub stamp: String,
}

impl PendingMutation {
    pub fn new(id: impl Into<String>, event: SyncEvent) -> Self {
        Self {
            id: id.into(),
            event,
            stamp: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Query Sync Metadata record, keyed by query signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCacheRecord {
    #[serde(rename = "_id")]
    pub signature: String,
    #[serde(rename = "lastRequest")]
    pub last_request: String,
}

// ============================================================================
// Push / pull results
// ============================================================================

/// Outcome of replaying one pending mutation.
///
/// `id` is the id the mutation was recorded under (the local id for a
/// pushed Create). Exactly one of `entity`/`error` is meaningful: `entity`
/// is the remote-confirmed document for Create/Update successes.
#[derive(Debug, Clone)]
pub struct PushResult {
    pub id: String,
    pub event: SyncEvent,
    pub entity: Option<Value>,
    pub error: Option<PushError>,
}

impl PushResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-record push failure. The pending mutation is retained unless the
/// entity it refers to no longer exists locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    Remote(RemoteError),
    /// Local storage failed while loading or confirming the entity.
    Storage(String),
    /// A Create/Update mutation whose entity is gone from the local cache.
    MissingEntity,
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Remote(e) => write!(f, "{e}"),
            PushError::Storage(msg) => write!(f, "Storage error: {msg}"),
            PushError::MissingEntity => write!(f, "Entity missing from local cache"),
        }
    }
}

/// Combined result of `sync()`.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub push: Vec<PushResult>,
    pub pull: usize,
}

// ============================================================================
// Options
// ============================================================================

/// Auto-pagination setting for pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoPagination {
    Disabled,
    /// Page with the configured default size.
    Enabled,
    PageSize(usize),
}

impl From<bool> for AutoPagination {
    fn from(enabled: bool) -> Self {
        if enabled {
            AutoPagination::Enabled
        } else {
            AutoPagination::Disabled
        }
    }
}

/// Per-call options. Unset fields fall back to [`SyncConfig`](crate::config::SyncConfig).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub auto_sync: Option<bool>,
    pub use_delta_set: Option<bool>,
    pub auto_pagination: Option<AutoPagination>,
    /// Push pending mutations in scope before a pull instead of failing.
    pub push_first: Option<bool>,
}

impl SyncOptions {
    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = Some(enabled);
        self
    }

    pub fn use_delta_set(mut self, enabled: bool) -> Self {
        self.use_delta_set = Some(enabled);
        self
    }

    pub fn auto_pagination(mut self, pagination: impl Into<AutoPagination>) -> Self {
        self.auto_pagination = Some(pagination.into());
        self
    }

    pub fn push_first(mut self, enabled: bool) -> Self {
        self.push_first = Some(enabled);
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
