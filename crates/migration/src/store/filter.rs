//! Typed query filters.
//!
//! A [`Filter`] is evaluated directly by the in-memory store and converted to a
//! BSON query document by the MongoDB store. Field paths use MongoDB dot
//! notation; traversing an array matches if any element matches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::DocumentId;

/// A value that can be compared with `Gt`/`Lt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Comparable {
    /// Timestamps (stored as BSON dates, RFC 3339 strings in JSON).
    Date(DateTime<Utc>),
    Number(f64),
    Text(String),
}

/// Query filter over stored documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Filter {
    /// Matches every document.
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Eq { field: String, value: Value },
    /// Case-insensitive whole-string equality.
    EqIgnoreCase { field: String, value: String },
    In { field: String, values: Vec<Value> },
    Exists { field: String, exists: bool },
    /// `{field: {$elemMatch: {system, code}}}` over a coding array.
    SecurityTag {
        field: String,
        system: String,
        code: String,
    },
    /// String field whose length is strictly greater than `length`.
    StringLongerThan { field: String, length: usize },
    Gt { field: String, value: Comparable },
    Lt { field: String, value: Comparable },
    IdGte(DocumentId),
    IdGt(DocumentId),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Filter::Exists {
            field: field.into(),
            exists: true,
        }
    }

    pub fn is_in(field: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Self {
        Filter::In {
            field: field.into(),
            values: values.into_iter().collect(),
        }
    }

    /// `meta.security` contains `{system, code}`.
    pub fn security_tag(system: impl Into<String>, code: impl Into<String>) -> Self {
        Filter::SecurityTag {
            field: "meta.security".to_string(),
            system: system.into(),
            code: code.into(),
        }
    }

    /// Combines two filters with `$and`, flattening and dropping `All`.
    pub fn and(self, other: Filter) -> Filter {
        let mut parts = Vec::new();
        for filter in [self, other] {
            match filter {
                Filter::All => {}
                Filter::And(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Filter::All,
            1 => parts.remove(0),
            _ => Filter::And(parts),
        }
    }

    /// Prefixes every field path (not `_id`), e.g. with `resource.` for history collections.
    pub fn prefixed(self, prefix: &str) -> Filter {
        if prefix.is_empty() {
            return self;
        }
        let p = |field: String| format!("{prefix}{field}");
        match self {
            Filter::All => Filter::All,
            Filter::And(inner) => Filter::And(inner.into_iter().map(|f| f.prefixed(prefix)).collect()),
            Filter::Or(inner) => Filter::Or(inner.into_iter().map(|f| f.prefixed(prefix)).collect()),
            Filter::Eq { field, value } => Filter::Eq { field: p(field), value },
            Filter::EqIgnoreCase { field, value } => Filter::EqIgnoreCase { field: p(field), value },
            Filter::In { field, values } => Filter::In { field: p(field), values },
            Filter::Exists { field, exists } => Filter::Exists { field: p(field), exists },
            Filter::SecurityTag {
                field,
                system,
                code,
            } => Filter::SecurityTag {
                field: p(field),
                system,
                code,
            },
            Filter::StringLongerThan { field, length } => Filter::StringLongerThan { field: p(field), length },
            Filter::Gt { field, value } => Filter::Gt { field: p(field), value },
            Filter::Lt { field, value } => Filter::Lt { field: p(field), value },
            id @ (Filter::IdGte(_) | Filter::IdGt(_)) => id,
        }
    }

    /// Evaluates the filter against a document.
    pub fn matches(&self, id: &DocumentId, body: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::And(inner) => inner.iter().all(|f| f.matches(id, body)),
            Filter::Or(inner) => inner.iter().any(|f| f.matches(id, body)),
            Filter::Eq { field, value } => resolve(body, field).into_iter().any(|v| v == value),
            Filter::EqIgnoreCase { field, value } => resolve(body, field)
                .into_iter()
                .filter_map(Value::as_str)
                .any(|v| v.eq_ignore_ascii_case(value)),
            Filter::In { field, values } => resolve(body, field)
                .into_iter()
                .any(|v| values.contains(v)),
            Filter::Exists { field, exists } => !resolve_raw(body, field).is_empty() == *exists,
            Filter::SecurityTag {
                field,
                system,
                code,
            } => resolve(body, field).into_iter().any(|tag| {
                tag.get("system").and_then(Value::as_str) == Some(system.as_str())
                    && tag.get("code").and_then(Value::as_str) == Some(code.as_str())
            }),
            Filter::StringLongerThan { field, length } => resolve(body, field)
                .into_iter()
                .filter_map(Value::as_str)
                .any(|v| v.chars().count() > *length),
            Filter::Gt { field, value } => resolve(body, field)
                .into_iter()
                .any(|v| compare(v, value).is_some_and(|o| o.is_gt())),
            Filter::Lt { field, value } => resolve(body, field)
                .into_iter()
                .any(|v| compare(v, value).is_some_and(|o| o.is_lt())),
            Filter::IdGte(start) => id >= start,
            Filter::IdGt(start) => id > start,
        }
    }
}

fn compare(actual: &Value, bound: &Comparable) -> Option<std::cmp::Ordering> {
    match bound {
        Comparable::Date(bound) => {
            let actual = DateTime::parse_from_rfc3339(actual.as_str()?).ok()?;
            Some(actual.with_timezone(&Utc).cmp(bound))
        }
        Comparable::Number(bound) => actual.as_f64()?.partial_cmp(bound),
        Comparable::Text(bound) => Some(actual.as_str()?.cmp(bound.as_str())),
    }
}

/// Resolves a dot path to the values found at its end, without flattening a
/// terminal array.
fn resolve_raw<'a>(body: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![body];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => next.extend(map.get(segment)),
                Value::Array(items) => {
                    if let Ok(index) = segment.parse::<usize>() {
                        next.extend(items.get(index));
                    } else {
                        next.extend(items.iter().filter_map(|item| item.get(segment)));
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    current
}

/// Like [`resolve_raw`] but a terminal array contributes its elements too.
fn resolve<'a>(body: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    for value in resolve_raw(body, path) {
        out.push(value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}
