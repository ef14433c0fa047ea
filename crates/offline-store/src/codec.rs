//! Persisted-boundary encoding for documents.
//!
//! Documents are JSON, but they may carry binary payloads. Binary values are
//! stored as type-tagged objects:
//!
//! ```text
//! { "_type": "Blob", "mimeType": "image/png", "data": "<base64>" }
//! ```
//!
//! [`Blob`] converts between raw bytes and the tagged form. The durable
//! adapters encode documents with [`encode_document`] and verify every tagged
//! value in [`decode_document`], so a truncated or hand-edited payload is
//! reported as corruption instead of surfacing as garbage bytes later.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};

use crate::error::{Result, StorageError, StoreError};

/// Type marker key of a tagged value.
pub const TYPE_TAG: &str = "_type";
/// Marker value for binary blobs.
pub const BLOB_TYPE: &str = "Blob";

const MIME_FIELD: &str = "mimeType";
const DATA_FIELD: &str = "data";

// ============================================================================
// Blob
// ============================================================================

/// Binary payload that round-trips through JSON persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(mime_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Tagged JSON representation.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(TYPE_TAG.to_string(), Value::String(BLOB_TYPE.to_string()));
        obj.insert(MIME_FIELD.to_string(), Value::String(self.mime_type.clone()));
        obj.insert(DATA_FIELD.to_string(), Value::String(STANDARD.encode(&self.data)));
        Value::Object(obj)
    }

    /// Decode a tagged value. Returns `None` if `value` is not tagged as a blob.
    pub fn from_value(value: &Value) -> Option<std::result::Result<Self, BlobDecodeError>> {
        if !is_blob(value) {
            return None;
        }
        let obj = value.as_object()?;
        let mime_type = obj
            .get(MIME_FIELD)
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_string();
        let decoded = match obj.get(DATA_FIELD).and_then(Value::as_str) {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(|data| Blob { mime_type, data })
                .map_err(|e| BlobDecodeError(e.to_string())),
            None => Err(BlobDecodeError("missing data field".to_string())),
        };
        Some(decoded)
    }
}

impl From<Blob> for Value {
    fn from(blob: Blob) -> Self {
        blob.to_value()
    }
}

/// A tagged blob whose payload cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDecodeError(pub String);

impl std::fmt::Display for BlobDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid blob payload: {}", self.0)
    }
}

impl std::error::Error for BlobDecodeError {}

/// True if `value` carries the blob type marker.
pub fn is_blob(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|o| o.get(TYPE_TAG))
        .and_then(Value::as_str)
        == Some(BLOB_TYPE)
}

/// Depth-first search for the first tagged value that fails to decode.
fn find_invalid_blob(value: &Value) -> Option<BlobDecodeError> {
    if let Some(Err(e)) = Blob::from_value(value) {
        return Some(e);
    }
    match value {
        Value::Array(items) => items.iter().find_map(find_invalid_blob),
        Value::Object(obj) if !is_blob(value) => obj.values().find_map(find_invalid_blob),
        _ => None,
    }
}

// ============================================================================
// Document encoding
// ============================================================================

/// Serialize a document for a durable backend.
pub fn encode_document(doc: &Value) -> Result<String> {
    serde_json::to_string(doc).map_err(|e| StoreError::Internal(format!("encode document: {e}")))
}

/// Serialize a list of documents (single-keyspace backends store whole collections).
pub fn encode_documents(docs: &[Value]) -> Result<String> {
    serde_json::to_string(docs).map_err(|e| StoreError::Internal(format!("encode documents: {e}")))
}

/// Parse a persisted document and verify its tagged values.
pub fn decode_document(collection: &str, id: &str, raw: &str) -> Result<Value> {
    let doc: Value = serde_json::from_str(raw).map_err(|e| corruption(collection, id, e))?;
    if let Some(e) = find_invalid_blob(&doc) {
        return Err(corruption(collection, id, e));
    }
    Ok(doc)
}

/// Parse a persisted collection.
pub fn decode_documents(collection: &str, raw: &str) -> Result<Vec<Value>> {
    let docs: Vec<Value> = serde_json::from_str(raw).map_err(|e| corruption(collection, "*", e))?;
    for doc in &docs {
        if let Some(e) = find_invalid_blob(doc) {
            let id = crate::types::entity_id(doc).unwrap_or("*");
            return Err(corruption(collection, id, e));
        }
    }
    Ok(docs)
}

fn corruption(
    collection: &str,
    id: &str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> StoreError {
    StorageError::Corruption {
        collection: collection.to_string(),
        id: id.to_string(),
        source: Box::new(source),
    }
    .into()
}
