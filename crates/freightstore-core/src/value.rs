//! The heterogeneous value model stored inside boxes.
//!
//! A stored record is a string-keyed map at the top level; nested values
//! may be any variant. Deep equality (`PartialEq`) is what compare-and-swap
//! uses: `Null` matches only `Null`, strings compare bytewise, numbers by
//! representation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;

/// A single storable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// Signed 64-bit integer
    Int(i64),
    /// 64-bit IEEE-754 float
    Double(f64),
    Str(String),
    List(Vec<Value>),
    /// String-keyed mapping, sorted by key
    Map(BTreeMap<String, Value>),
    /// Instant with millisecond precision on disk
    DateTime(DateTime<Utc>),
    Bytes(Vec<u8>),
    /// Arbitrary-precision integer
    BigInt(BigInt),
}

impl Value {
    /// Variant name used in codec diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::DateTime(_) => "datetime",
            Value::Bytes(_) => "byte-string",
            Value::BigInt(_) => "bigint",
        }
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    /// Borrow the map entries of a `Map` value.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up a top-level field of a `Map` value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.as_map().and_then(|entries| entries.get(name))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Double(x)
    }
}

/// Build a `Value::Map` from literal entries.
///
/// ```
/// use freightstore_core::value_map;
/// let v = value_map! { "name" => "Alice", "age" => 30i64 };
/// assert_eq!(v.field("name").unwrap().as_str(), Some("Alice"));
/// ```
#[macro_export]
macro_rules! value_map {
    () => { $crate::Value::Map(std::collections::BTreeMap::new()) };
    ($($key:expr => $val:expr),+ $(,)?) => {{
        let mut entries = std::collections::BTreeMap::new();
        $(entries.insert($key.to_string(), $crate::Value::from($val));)+
        $crate::Value::Map(entries)
    }};
}
