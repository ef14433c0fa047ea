//! Group-by aggregation over an in-memory document list.
//!
//! Documents are partitioned by the values of the key fields; each group
//! starts from a copy of the initial accumulator, and every document is
//! folded into its group's accumulator by the reducer. Each result row is
//! the key fields merged with the final accumulator.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::query::operators::get_field_value;
use crate::query::{execute_query, Query};

/// Folds one document into a group accumulator.
pub type Reducer = Arc<dyn Fn(&Value, &mut Map<String, Value>) + Send + Sync>;

#[derive(Clone)]
pub struct Aggregation {
    key: Vec<String>,
    initial: Map<String, Value>,
    reduce: Reducer,
    condition: Option<Query>,
}

impl fmt::Debug for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregation")
            .field("key", &self.key)
            .field("initial", &self.initial)
            .field("condition", &self.condition)
            .finish_non_exhaustive()
    }
}

impl Aggregation {
    pub fn new(
        initial: Map<String, Value>,
        reduce: impl Fn(&Value, &mut Map<String, Value>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: Vec::new(),
            initial,
            reduce: Arc::new(reduce),
            condition: None,
        }
    }

    /// Add a grouping field.
    pub fn by(mut self, field: &str) -> Self {
        self.key.push(field.to_string());
        self
    }

    /// Only aggregate documents matching `query`.
    pub fn with_condition(mut self, query: Query) -> Self {
        self.condition = Some(query);
        self
    }

    pub fn condition(&self) -> Option<&Query> {
        self.condition.as_ref()
    }

    /// Number of documents per distinct value of `field`.
    pub fn count(field: &str) -> Self {
        Self::new(object(json!({ "count": 0 })), |_, acc| {
            let n = acc.get("count").and_then(Value::as_u64).unwrap_or(0);
            acc.insert("count".to_string(), json!(n + 1));
        })
        .by(field)
    }

    /// Sum of a numeric field; non-numeric values are skipped.
    pub fn sum(field: &str) -> Self {
        let field = field.to_string();
        Self::new(object(json!({ "sum": 0 })), move |doc, acc| {
            if let Some(n) = number_at(doc, &field) {
                let total = acc.get("sum").and_then(Value::as_f64).unwrap_or(0.0);
                acc.insert("sum".to_string(), json!(total + n));
            }
        })
    }

    /// Minimum of a numeric field (`null` if no document has one).
    pub fn min(field: &str) -> Self {
        Self::extreme(field, "min", |candidate, current| candidate < current)
    }

    /// Maximum of a numeric field (`null` if no document has one).
    pub fn max(field: &str) -> Self {
        Self::extreme(field, "max", |candidate, current| candidate > current)
    }

    /// Running mean of a numeric field alongside the number of values seen.
    pub fn average(field: &str) -> Self {
        let field = field.to_string();
        Self::new(object(json!({ "count": 0, "average": 0 })), move |doc, acc| {
            if let Some(n) = number_at(doc, &field) {
                let count = acc.get("count").and_then(Value::as_f64).unwrap_or(0.0);
                let avg = acc.get("average").and_then(Value::as_f64).unwrap_or(0.0);
                acc.insert("average".to_string(), json!((avg * count + n) / (count + 1.0)));
                acc.insert("count".to_string(), json!(count as u64 + 1));
            }
        })
    }

    fn extreme(field: &str, out: &'static str, better: fn(f64, f64) -> bool) -> Self {
        let field = field.to_string();
        let mut initial = Map::new();
        initial.insert(out.to_string(), Value::Null);
        Self::new(initial, move |doc, acc| {
            if let Some(n) = number_at(doc, &field) {
                let replace = match acc.get(out).and_then(Value::as_f64) {
                    Some(current) => better(n, current),
                    None => true,
                };
                if replace {
                    acc.insert(out.to_string(), json!(n));
                }
            }
        })
    }

    /// Run the aggregation. Groups are returned in first-seen order.
    pub fn process(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let docs = match &self.condition {
            Some(query) => execute_query(docs, query)?,
            None => docs,
        };

        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(Map<String, Value>, Map<String, Value>)> = Vec::new();

        for doc in &docs {
            let key_values: Map<String, Value> = self
                .key
                .iter()
                .map(|field| {
                    let v = get_field_value(doc, field).cloned().unwrap_or(Value::Null);
                    (field.clone(), v)
                })
                .collect();
            let group_key = Value::Object(key_values.clone()).to_string();
            let slot = *index.entry(group_key).or_insert_with(|| {
                groups.push((key_values, self.initial.clone()));
                groups.len() - 1
            });
            (self.reduce)(doc, &mut groups[slot].1);
        }

        Ok(groups
            .into_iter()
            .map(|(mut key, acc)| {
                key.extend(acc);
                Value::Object(key)
            })
            .collect())
    }
}

fn object(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn number_at(doc: &Value, field: &str) -> Option<f64> {
    get_field_value(doc, field).and_then(Value::as_f64)
}
