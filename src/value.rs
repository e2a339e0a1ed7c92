//! Backend-independent scalar values.
//!
//! Every condition, data assignment, and entity field carries a [`Value`];
//! backends decide how each variant renders into their native command form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::FieldType;

/// A value bound into a query descriptor or entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// String
    String(String),
    /// UUID value
    Uuid(Uuid),
    /// Timestamp value
    DateTime(DateTime<Utc>),
    /// Array of values
    Array(Vec<Value>),
    /// Nested document (ordered key/value pairs)
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Loose truthiness, used when a boolean column receives a non-boolean.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::String(s) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
            _ => true,
        }
    }

    /// The raw literal without any quoting. Strings come back verbatim.
    pub fn plain(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Uuid(u) => u.to_string(),
            Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            Value::Array(items) => items
                .iter()
                .map(Value::plain)
                .collect::<Vec<_>>()
                .join(", "),
            Value::Map(_) => serde_json::Value::from(self).to_string(),
        }
    }

    /// Introspect a storage type when the schema declares none.
    ///
    /// Strings are sniffed: all digits reads as an integer, a decimal shape
    /// as a float, anything up to 255 characters as a plain string, and
    /// longer payloads as text.
    pub fn infer_type(&self) -> FieldType {
        match self {
            Value::Bool(_) => FieldType::Boolean,
            Value::Int(_) => FieldType::Integer,
            Value::Float(_) => FieldType::Float,
            Value::DateTime(_) => FieldType::DateTime,
            Value::Uuid(_) => FieldType::String,
            Value::String(s) => {
                let body = s.strip_prefix('-').unwrap_or(s);
                if !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit()) {
                    FieldType::Integer
                } else if looks_decimal(body) {
                    FieldType::Float
                } else if s.len() <= 255 {
                    FieldType::String
                } else {
                    FieldType::Text
                }
            }
            Value::Map(_) | Value::Array(_) => FieldType::Text,
            Value::Null => FieldType::String,
        }
    }
}

fn looks_decimal(s: &str) -> bool {
    let mut parts = s.splitn(2, '.');
    match (parts.next(), parts.next()) {
        (Some(int), Some(frac)) => {
            !frac.is_empty()
                && int.bytes().all(|b| b.is_ascii_digit())
                && frac.bytes().all(|b| b.is_ascii_digit())
        }
        _ => false,
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "'{}'", s),
            Value::Uuid(u) => write!(f, "'{}'", u),
            Value::DateTime(dt) => write!(f, "'{}'", dt.format("%Y-%m-%d %H:%M:%S")),
            Value::Array(arr) => {
                write!(f, "[")?;
                for (i, v) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(_) => write!(f, "{}", serde_json::Value::from(self)),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
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

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(items: Vec<V>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Uuid(u) => serde_json::Value::String(u.to_string()),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Map(pairs) => {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs {
                    map.insert(k.clone(), serde_json::Value::from(v));
                }
                serde_json::Value::Object(map)
            }
        }
    }
}
