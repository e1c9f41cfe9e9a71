use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{CompareOp, FilterExpr, Literal};

/// Resolves a `/`-separated path inside a JSON document. Missing fields are `Null`.
pub fn resolve_path<'a>(doc: &'a Value, path: &[String]) -> &'a Value {
    let mut current = doc;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return &Value::Null,
        }
    }
    current
}

impl FilterExpr {
    /// Evaluates the expression against a serialized entity.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::And(terms) => terms.iter().all(|t| t.matches(doc)),
            Self::Or(terms) => terms.iter().any(|t| t.matches(doc)),
            Self::Not(inner) => !inner.matches(doc),
            Self::Compare { path, op, value } => compare(resolve_path(doc, path), *op, value),
        }
    }
}

fn compare(actual: &Value, op: CompareOp, expected: &Literal) -> bool {
    let ordering = order(actual, expected);
    match op {
        CompareOp::Eq => ordering == Some(Ordering::Equal),
        CompareOp::Ne => ordering != Some(Ordering::Equal),
        CompareOp::Lt => ordering == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => ordering == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
}

/// Orders a stored value against a literal. `None` means incomparable; only
/// `ne` holds for incomparable operands. Null compares equal only to null.
fn order(actual: &Value, expected: &Literal) -> Option<Ordering> {
    match (actual, expected) {
        (Value::Null, Literal::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Literal::Null) => None,
        (Value::Bool(a), Literal::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Literal::Number(b)) => a.as_f64().and_then(|a| a.partial_cmp(b)),
        (Value::String(a), Literal::Time(b)) => parse_time(a).map(|a| a.cmp(b)),
        (Value::String(a), Literal::String(b)) => match (parse_time(a), parse_time(b)) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => Some(a.as_str().cmp(b.as_str())),
        },
        _ => None,
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Applies a `select` projection: only the listed top-level fields are kept.
/// `id` is always kept.
pub fn project(doc: Value, select: &str) -> Value {
    let Value::Object(map) = doc else {
        return doc;
    };

    let mut fields: Vec<&str> = select
        .split(',')
        .map(|f| f.trim().split('/').next().unwrap_or_default())
        .filter(|f| !f.is_empty())
        .collect();
    if fields.is_empty() {
        return Value::Object(map);
    }
    fields.push("id");

    let projected: Map<String, Value> = map
        .into_iter()
        .filter(|(key, _)| fields.contains(&key.as_str()))
        .collect();
    Value::Object(projected)
}
