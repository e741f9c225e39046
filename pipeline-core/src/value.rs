//! ABOUTME: The tagged-union Value type all step results, prompt parts, and
//! ABOUTME: template substitutions are expressed in, plus dotted-path access.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A dynamically-typed value flowing through the pipeline: step results,
/// extracted fields, transformed data, and provider responses are all
/// represented with this single type rather than an untyped JSON blob.
///
/// `Value` round-trips through `serde_json::Value` exactly (modulo numeric
/// representation, since all numbers are stored as `f64`), which is what the
/// checkpoint writer and the `data_transform`/`gemini` steps rely on.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Scalar values render directly; a scalar is anything that is not a
    /// `List` or `Map` — used by the Result Store and Prompt Builder to
    /// decide between plain string rendering and pretty-printed JSON.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::List(_) | Value::Map(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Render a scalar as its bare string form; non-scalars render as
    /// pretty-printed JSON. Used by the Prompt Builder and Template Engine.
    pub fn render(&self) -> String {
        match self {
            Value::Null => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::List(_) | Value::Map(_) => {
                serde_json::to_string_pretty(&serde_json::Value::from(self.clone()))
                    .unwrap_or_default()
            }
        }
    }

    /// Truthiness used by the Condition Engine for bare step-field references.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    /// Traverse a dotted path (`field.sub`, with numeric segments indexing
    /// into lists). Returns `None` when any segment is missing, which the
    /// caller distinguishes from "present but null" by checking `is_null()`
    /// on a returned `Some(Value::Null)`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                Value::Map(map) => map.get(segment)?,
                Value::List(items) => {
                    let idx: usize = segment.parse().ok()?;
                    items.get(idx)?
                }
                _ => return None,
            };
        }
        Some(current)
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_json::Value::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_structure() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::from(1.0));
        map.insert(
            "b".to_string(),
            Value::List(vec![Value::from("x"), Value::Null, Value::Bool(true)]),
        );
        let original = Value::Map(map);

        let json = serde_json::to_string(&original).unwrap();
        let restored: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn get_path_traverses_maps_and_lists() {
        let value: Value = serde_json::json!({
            "items": [{"name": "a"}, {"name": "b"}]
        })
        .into();

        assert_eq!(
            value.get_path("items.1.name").and_then(Value::as_str),
            Some("b")
        );
        assert!(value.get_path("items.missing").is_none());
    }

    #[test]
    fn get_path_distinguishes_null_from_missing() {
        let value: Value = serde_json::json!({"present": null}).into();
        assert_eq!(value.get_path("present"), Some(&Value::Null));
        assert_eq!(value.get_path("absent"), None);
    }

    #[test]
    fn render_uses_plain_form_for_scalars_and_json_for_others() {
        assert_eq!(Value::from(3.0).render(), "3");
        assert_eq!(Value::Null.render(), "nil");
        assert_eq!(Value::from("hi").render(), "hi");
        let list = Value::list(vec![Value::from(1.0), Value::from(2.0)]);
        assert!(list.render().contains('['));
    }

    #[test]
    fn truthiness_follows_common_scripting_rules() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(!Value::from(0.0).is_truthy());
        assert!(Value::from(1.0).is_truthy());
    }
}
