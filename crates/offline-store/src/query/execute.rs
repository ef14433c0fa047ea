//! Query execution: scan and filter, then sort and page.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::Result;

use super::operators::{compare_values, filter_documents, get_field_value, matches_filter};
use super::types::{Query, SortDirection, SortEntry};

/// Stable multi-key sort; earlier entries take priority.
pub fn sort_documents(docs: &mut [Value], sort: &[SortEntry]) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        sort.iter()
            .map(|entry| {
                let va = get_field_value(a, &entry.field).unwrap_or(&Value::Null);
                let vb = get_field_value(b, &entry.field).unwrap_or(&Value::Null);
                match entry.direction {
                    SortDirection::Asc => compare_values(va, vb),
                    SortDirection::Desc => compare_values(va, vb).reverse(),
                }
            })
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

/// Apply a query to a full document list: filter, then sort, then skip/limit.
pub fn execute_query(docs: Vec<Value>, query: &Query) -> Result<Vec<Value>> {
    let mut matched = match &query.filter {
        Some(filter) => filter_documents(docs, filter)?,
        None => docs,
    };
    sort_documents(&mut matched, &query.sort);

    let window = matched.into_iter().skip(query.skip);
    Ok(match query.limit {
        Some(limit) => window.take(limit).collect(),
        None => window.collect(),
    })
}

/// Count documents matched by a query, honoring its skip/limit window.
pub fn count_matching(docs: &[Value], query: &Query) -> Result<usize> {
    let mut matched: usize = 0;
    for doc in docs {
        let hit = match &query.filter {
            Some(filter) => matches_filter(doc, filter)?,
            None => true,
        };
        if hit {
            matched += 1;
        }
    }
    let after_skip = matched.saturating_sub(query.skip);
    Ok(query.limit.map_or(after_skip, |limit| after_skip.min(limit)))
}
