//! Query type definitions: filter, sort, pagination, and signatures.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::types::ID_FIELD;

// ============================================================================
// Sort Types
// ============================================================================

/// Sort direction for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// A sort specification for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortEntry {
    pub field: String,
    pub direction: SortDirection,
}

// ============================================================================
// Query Type
// ============================================================================

/// Filter, sort, and paging window applied to a collection.
///
/// The filter is a MongoDB-style object (see [`operators`](super::operators)).
/// The same value is handed verbatim to the remote store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortEntry>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub skip: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the filter.
    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Add a `field == value` condition (implicit AND with existing fields).
    pub fn equal_to(self, field: &str, value: impl Into<Value>) -> Self {
        self.with_condition(field, value.into())
    }

    /// Add a `field ∈ values` condition.
    pub fn contained_in<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.with_condition(field, json!({ "$in": values }))
    }

    /// Query matching a single entity id.
    pub fn by_id(id: &str) -> Self {
        Self::new().equal_to(ID_FIELD, id)
    }

    /// Query matching any of the given entity ids.
    pub fn by_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new().contained_in(ID_FIELD, ids.into_iter().map(Into::into))
    }

    pub fn ascending(mut self, field: &str) -> Self {
        self.sort.push(SortEntry {
            field: field.to_string(),
            direction: SortDirection::Asc,
        });
        self
    }

    pub fn descending(mut self, field: &str) -> Self {
        self.sort.push(SortEntry {
            field: field.to_string(),
            direction: SortDirection::Desc,
        });
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True if the query selects a window rather than the whole match set.
    pub fn is_windowed(&self) -> bool {
        self.skip > 0 || self.limit.is_some()
    }

    fn with_condition(mut self, field: &str, condition: Value) -> Self {
        let mut obj = match self.filter.take() {
            Some(Value::Object(obj)) => obj,
            Some(other) => {
                // Non-object filters are wrapped so the new condition ANDs with them.
                let mut wrapped = Map::new();
                wrapped.insert("$and".to_string(), Value::Array(vec![other]));
                wrapped
            }
            None => Map::new(),
        };
        obj.insert(field.to_string(), condition);
        self.filter = Some(Value::Object(obj));
        self
    }
}

// ============================================================================
// Signatures
// ============================================================================

/// Stable key identifying the scope of a query for delta tracking.
///
/// `None` and the default query share one signature. Windowed queries
/// (nonzero skip or a limit) are untrackable and yield `None`: a partial
/// window cannot be reconciled incrementally.
pub fn signature(query: Option<&Query>) -> Option<String> {
    let (filter, sort) = match query {
        Some(q) if q.is_windowed() => return None,
        Some(q) => (q.filter.clone().unwrap_or(Value::Null), q.sort.clone()),
        None => (Value::Null, Vec::new()),
    };
    // serde_json maps are key-ordered, so equal filters serialize identically.
    let key = json!({ "filter": filter, "sort": sort });
    Some(key.to_string())
}

// ============================================================================
// Tests
// ============================================================================
