//! Metadata filter expressions.
//!
//! Filters are plain serde values so they travel unchanged over JSON-RPC and the CLI:
//!
//! ```json
//! {"and": [
//!   {"field": "status", "op": "eq", "value": "active"},
//!   {"field": "version", "op": "gt", "value": 1.0},
//!   {"not": {"field": "draft", "op": "exists"}}
//! ]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{codec::Metadata, error::NotedownError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    Eq,
    Neq,
    Contains,
    StartsWith,
    EndsWith,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataPredicate {
    pub field: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Value,
}

impl MetadataPredicate {
    pub fn new(field: &str, op: FilterOp, value: Value) -> Self {
        MetadataPredicate {
            field: field.to_string(),
            op,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterExpression {
    And(Vec<FilterExpression>),
    Or(Vec<FilterExpression>),
    Not(Option<Box<FilterExpression>>),
    #[serde(untagged)]
    Metadata(MetadataPredicate),
}

impl FilterExpression {
    pub fn predicate(field: &str, op: FilterOp, value: Value) -> Self {
        FilterExpression::Metadata(MetadataPredicate::new(field, op, value))
    }

    pub fn negate(expr: FilterExpression) -> Self {
        FilterExpression::Not(Some(Box::new(expr)))
    }

    pub fn evaluate(&self, metadata: &Metadata) -> Result<bool, NotedownError> {
        evaluate(self, metadata)
    }
}

/// Evaluate `expr` against a document's metadata.
///
/// Ordering operators fail when either side cannot be read as a number, `in`/`notIn` fail when
/// the filter value is not a list. Every other mismatch simply evaluates to `false`.
pub fn evaluate(expr: &FilterExpression, metadata: &Metadata) -> Result<bool, NotedownError> {
    match expr {
        FilterExpression::And(exprs) => {
            for expr in exprs.iter() {
                if !evaluate(expr, metadata)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        FilterExpression::Or(exprs) => {
            for expr in exprs.iter() {
                if evaluate(expr, metadata)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterExpression::Not(None) => Ok(true),
        FilterExpression::Not(Some(expr)) => Ok(!evaluate(expr, metadata)?),
        FilterExpression::Metadata(pred) => evaluate_predicate(pred, metadata),
    }
}

/// Look up a field, descending into nested maps for dotted names that are not top-level keys.
fn lookup<'a>(metadata: &'a Metadata, field: &str) -> Option<&'a Value> {
    if let Some(value) = metadata.get(field) {
        return Some(value);
    }
    let mut parts = field.split('.');
    let mut current = metadata.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn evaluate_predicate(pred: &MetadataPredicate, metadata: &Metadata) -> Result<bool, NotedownError> {
    let field = lookup(metadata, &pred.field);
    match pred.op {
        FilterOp::Exists => return Ok(field.is_some()),
        FilterOp::NotExists => return Ok(field.is_none()),
        _ => {}
    }
    let Some(field) = field else {
        return Ok(false);
    };
    let value = &pred.value;
    let result = match pred.op {
        FilterOp::Eq => values_equal(field, value),
        FilterOp::Neq => !values_equal(field, value),
        FilterOp::Contains => match (field, value) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), _) => items.iter().any(|item| values_equal(item, value)),
            _ => false,
        },
        FilterOp::StartsWith => match (field, value) {
            (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        FilterOp::EndsWith => match (field, value) {
            (Value::String(s), Value::String(suffix)) => s.ends_with(suffix.as_str()),
            _ => false,
        },
        FilterOp::Lt => as_f64(field, &pred.field)? < as_f64(value, &pred.field)?,
        FilterOp::Lte => as_f64(field, &pred.field)? <= as_f64(value, &pred.field)?,
        FilterOp::Gt => as_f64(field, &pred.field)? > as_f64(value, &pred.field)?,
        FilterOp::Gte => as_f64(field, &pred.field)? >= as_f64(value, &pred.field)?,
        FilterOp::In => list_value(value, pred)?
            .iter()
            .any(|candidate| values_equal(field, candidate)),
        FilterOp::NotIn => !list_value(value, pred)?
            .iter()
            .any(|candidate| values_equal(field, candidate)),
        FilterOp::Exists => true,
        FilterOp::NotExists => false,
    };
    Ok(result)
}

fn list_value<'a>(
    value: &'a Value,
    pred: &MetadataPredicate,
) -> Result<&'a Vec<Value>, NotedownError> {
    value.as_array().ok_or_else(|| {
        NotedownError::Filter(format!(
            "'{:?}' on field '{}' needs a list value, got {}",
            pred.op, pred.field, value
        ))
    })
}

fn as_f64(value: &Value, field: &str) -> Result<f64, NotedownError> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        NotedownError::Filter(format!(
            "cannot compare non-numeric value {value} for field '{field}'"
        ))
    })
}

/// Structural equality where numbers compare by value, so `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map(|y| values_equal(x, y)).unwrap_or(false))
        }
        _ => a == b,
    }
}
