//! The remote store seam.
//!
//! The network layer is an external collaborator: it is consumed through the
//! [`RemoteStore`] trait, one instance per collection path. Every call
//! returns the data together with [`ResponseMeta`], whose `request_start`
//! becomes the next delta cursor for the query that was served.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteError;
use crate::query::Query;

/// Metadata accompanying every remote response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// RFC 3339 timestamp of when the server started handling the request.
    #[serde(rename = "requestStart")]
    pub request_start: String,
}

impl ResponseMeta {
    pub fn new(request_start: impl Into<String>) -> Self {
        Self {
            request_start: request_start.into(),
        }
    }

    /// Meta stamped with the current time.
    pub fn now() -> Self {
        Self::new(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

/// Remote payload plus response metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse<T> {
    pub data: T,
    pub meta: ResponseMeta,
}

impl<T> RemoteResponse<T> {
    pub fn new(data: T, meta: ResponseMeta) -> Self {
        Self { data, meta }
    }
}

/// Result of a delta fetch: documents changed and ids deleted since a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaSet {
    pub changed: Vec<Value>,
    pub deleted: Vec<String>,
    pub meta: ResponseMeta,
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Network access to one remote collection.
///
/// `Query` values are forwarded verbatim; interpreting the filter is the
/// backend's job.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn find(&self, query: Option<&Query>) -> RemoteResult<RemoteResponse<Vec<Value>>>;

    async fn find_by_id(&self, id: &str) -> RemoteResult<RemoteResponse<Value>>;

    async fn count(&self, query: Option<&Query>) -> RemoteResult<RemoteResponse<usize>>;

    /// The backend assigns the id of the created document.
    async fn create(&self, doc: Value) -> RemoteResult<RemoteResponse<Value>>;

    async fn update(&self, doc: Value) -> RemoteResult<RemoteResponse<Value>>;

    async fn remove_by_id(&self, id: &str) -> RemoteResult<ResponseMeta>;

    async fn remove(&self, query: Option<&Query>) -> RemoteResult<RemoteResponse<Vec<Value>>>;

    /// Changes matching `query` since the RFC 3339 timestamp `since`.
    ///
    /// Backends without delta support fail with
    /// [`RemoteErrorKind::DeltaSetUnavailable`](crate::error::RemoteErrorKind::DeltaSetUnavailable).
    async fn delta_fetch(&self, query: Option<&Query>, since: &str) -> RemoteResult<DeltaSet>;
}
