//! Dynamically-typed SQL values.

use chrono::{DateTime, Utc};
use std::fmt::Write as _;

/// A dynamically-typed SQL value as delivered by (or sent to) a driver.
///
/// This is the "any value" of the crate: rows read without a target type are
/// returned as `Vec<Value>`, and query arguments are always passed as values.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// NULL value
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    BigInt(i64),
    /// 64-bit floating point
    Double(f64),
    /// Text string
    Text(String),
    /// Binary data (always an owned copy)
    Bytes(Vec<u8>),
    /// Timestamp with time zone
    Timestamp(DateTime<Utc>),
    /// JSON document
    Json(serde_json::Value),
    /// Array of values
    Array(Vec<Value>),
}

impl Value {
    /// Short name of the value kind, used in scan errors.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "Bool",
            Value::BigInt(_) => "BigInt",
            Value::Double(_) => "Double",
            Value::Text(_) => "Text",
            Value::Bytes(_) => "Bytes",
            Value::Timestamp(_) => "Timestamp",
            Value::Json(_) => "Json",
            Value::Array(_) => "Array",
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for NULL and for the zero value of every kind.
    ///
    /// Zero means `false`, `0`, `0.0`, the empty string, empty bytes, an
    /// empty array, the Unix epoch, and JSON `null`.
    pub fn is_null_or_zero(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !*b,
            Value::BigInt(v) => *v == 0,
            Value::Double(v) => *v == 0.0,
            Value::Text(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::Timestamp(t) => t.timestamp() == 0 && t.timestamp_subsec_nanos() == 0,
            Value::Json(j) => j.is_null(),
            Value::Array(a) => a.is_empty(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::BigInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Plain string rendering used by string-list scans.
    ///
    /// Bytes are decoded as UTF-8 (lossy), NULL becomes the empty string and
    /// everything else uses its natural textual form.
    pub fn to_plain_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::BigInt(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Timestamp(t) => t.to_rfc3339(),
            Value::Json(j) => j.to_string(),
            Value::Array(items) => {
                let mut out = String::from("{");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{}", item.to_plain_string());
                }
                out.push('}');
                out
            }
        }
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::BigInt(v as i64)
            }
        }
    )*};
}

impl_from_int!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Double(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Conversion of a borrowed record field into a [`Value`].
///
/// Generated `Record` implementations call this for every mapped column.
pub trait ToValue {
    fn to_value(&self) -> Value;
}

macro_rules! impl_to_value_via_from {
    ($($ty:ty),*) => {$(
        impl ToValue for $ty {
            fn to_value(&self) -> Value {
                Value::from(*self)
            }
        }
    )*};
}

impl_to_value_via_from!(
    bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64
);

impl ToValue for DateTime<Utc> {
    fn to_value(&self) -> Value {
        Value::Timestamp(*self)
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }
}

impl ToValue for str {
    fn to_value(&self) -> Value {
        Value::Text(self.to_string())
    }
}

impl ToValue for Vec<u8> {
    fn to_value(&self) -> Value {
        Value::Bytes(self.clone())
    }
}

impl ToValue for serde_json::Value {
    fn to_value(&self) -> Value {
        Value::Json(self.clone())
    }
}

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Value {
        self.as_ref().map_or(Value::Null, ToValue::to_value)
    }
}

impl<T: ToValue + ?Sized> ToValue for &T {
    fn to_value(&self) -> Value {
        (**self).to_value()
    }
}

macro_rules! impl_to_value_array {
    ($($ty:ty),*) => {$(
        impl ToValue for Vec<$ty> {
            fn to_value(&self) -> Value {
                Value::Array(self.iter().map(ToValue::to_value).collect())
            }
        }
    )*};
}

impl_to_value_array!(i32, i64, f64, bool, String, Value);
