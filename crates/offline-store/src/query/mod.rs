//! In-memory query engine: filter, sort, skip/limit, and query signatures.
//!
//! Storage adapters have no native query capability; every query is applied
//! to the full document list after retrieval.

pub mod execute;
pub mod operators;
pub mod types;

pub use execute::{count_matching, execute_query};
pub use types::{signature, Query, SortDirection, SortEntry};
