//! Filter evaluation with MongoDB-style operators.
//!
//! Supported: `$eq $ne $gt $gte $lt $lte $in $nin $exists $regex` (with
//! `$options: "i"`), `$size`, `$all`, field-level `$not`, and the logical
//! combinators `$and $or $nor`. A scalar operand compared against an array
//! field matches when any element matches.

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::{Map, Value};

use crate::error::{QueryError, Result};

// ============================================================================
// Value comparison
// ============================================================================

/// Total order used for sorting and range operators.
///
/// Nulls sort last; mixed types order by rank number < string < bool < other.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => {
            let fx = x.as_f64().unwrap_or(f64::NAN);
            let fy = y.as_f64().unwrap_or(f64::NAN);
            fx.partial_cmp(&fy).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn rank(v: &Value) -> u8 {
    match v {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        _ => 3,
    }
}

/// Resolve a dot-separated path. `None` if any segment is missing.
pub fn get_field_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |current, part| current.as_object()?.get(part))
}

// ============================================================================
// Filter evaluation
// ============================================================================

/// Evaluate a filter object against a document. A non-object filter matches all.
pub fn matches_filter(doc: &Value, filter: &Value) -> Result<bool> {
    let Some(clauses) = filter.as_object() else {
        return Ok(true);
    };

    for (key, clause) in clauses {
        let matched = match key.as_str() {
            "$and" => all_match(doc, clause)?,
            "$or" => any_match(doc, clause)?,
            "$nor" => !any_match(doc, clause)?,
            k if k.starts_with('$') => return Err(QueryError::UnknownOperator(k.to_string()).into()),
            field => field_matches(get_field_value(doc, field), clause)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Return the documents matching `filter`, preserving order.
pub fn filter_documents(docs: Vec<Value>, filter: &Value) -> Result<Vec<Value>> {
    let mut kept = Vec::with_capacity(docs.len());
    for doc in docs {
        if matches_filter(&doc, filter)? {
            kept.push(doc);
        }
    }
    Ok(kept)
}

fn all_match(doc: &Value, clause: &Value) -> Result<bool> {
    for sub in clause.as_array().map(Vec::as_slice).unwrap_or_default() {
        if !matches_filter(doc, sub)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_match(doc: &Value, clause: &Value) -> Result<bool> {
    for sub in clause.as_array().map(Vec::as_slice).unwrap_or_default() {
        if matches_filter(doc, sub)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_operator_object(v: &Value) -> Option<&Map<String, Value>> {
    v.as_object()
        .filter(|o| !o.is_empty() && o.keys().all(|k| k.starts_with('$')))
}

/// Evaluate one field clause. `value` is `None` when the field is absent.
fn field_matches(value: Option<&Value>, clause: &Value) -> Result<bool> {
    let Some(ops) = is_operator_object(clause) else {
        return Ok(lifted(value.unwrap_or(&Value::Null), |v| v == clause));
    };

    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$exists" => value.is_some() == operand.as_bool().unwrap_or(true),
            "$not" => !field_matches(value, operand)?,
            "$options" => true,
            "$regex" => {
                let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                regex_matches(value, operand, options)?
            }
            _ => operator_matches(value.unwrap_or(&Value::Null), op, operand)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn operator_matches(value: &Value, op: &str, operand: &Value) -> Result<bool> {
    let ordered = |want: &[Ordering]| {
        lifted(value, |v| {
            !v.is_null() && !operand.is_null() && want.contains(&compare_values(v, operand))
        })
    };

    let matched = match op {
        "$eq" => lifted(value, |v| v == operand),
        "$ne" => !lifted(value, |v| v == operand),
        "$gt" => ordered(&[Ordering::Greater]),
        "$gte" => ordered(&[Ordering::Greater, Ordering::Equal]),
        "$lt" => ordered(&[Ordering::Less]),
        "$lte" => ordered(&[Ordering::Less, Ordering::Equal]),
        "$in" => match operand.as_array() {
            Some(items) => lifted(value, |v| items.contains(v)),
            None => false,
        },
        "$nin" => match operand.as_array() {
            Some(items) => !lifted(value, |v| items.contains(v)),
            None => true,
        },
        "$size" => match (value.as_array(), operand.as_u64()) {
            (Some(arr), Some(n)) => arr.len() as u64 == n,
            _ => false,
        },
        "$all" => match (value.as_array(), operand.as_array()) {
            (Some(arr), Some(targets)) => targets.iter().all(|t| arr.contains(t)),
            _ => false,
        },
        other => return Err(QueryError::UnknownOperator(other.to_string()).into()),
    };
    Ok(matched)
}

/// Apply `pred` to a scalar, or to any element when `value` is an array.
/// The array itself is also tested so whole-array equality works.
fn lifted(value: &Value, pred: impl Fn(&Value) -> bool) -> bool {
    match value {
        Value::Array(items) => pred(value) || items.iter().any(|item| pred(item)),
        scalar => pred(scalar),
    }
}

fn regex_matches(value: Option<&Value>, pattern: &Value, options: &str) -> Result<bool> {
    let Some(pattern) = pattern.as_str() else {
        return Ok(false);
    };
    let re = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .build()
        .map_err(|e| QueryError::InvalidRegex(e.to_string()))?;
    Ok(value.is_some_and(|v| lifted(v, |item| item.as_str().is_some_and(|s| re.is_match(s)))))
}
