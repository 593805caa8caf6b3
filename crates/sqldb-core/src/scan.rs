//! Decoding driver values into typed destinations.
//!
//! [`FromValue`] builds a fresh value of a type; [`ScanValue`] writes into an
//! existing destination and is what record scanning uses, since the derive
//! hands out `&mut dyn ScanValue` pointers into record fields. Every
//! `FromValue` type is automatically a `ScanValue`. Types with custom decoding
//! implement either trait directly.
//!
//! Conversion rules:
//!
//! | Source      | Accepted destinations                                     |
//! |-------------|-----------------------------------------------------------|
//! | `BigInt`    | every integer width (narrowing), `f32`, `f64`             |
//! | `Double`    | `f32`, `f64`, every integer width (truncation)            |
//! | `Bool`      | `bool`                                                    |
//! | `Bytes`     | `String` (UTF-8), `Vec<u8>`                               |
//! | `Text`      | `String`, `Vec<u8>`, `DateTime<Utc>` (RFC 3339), JSON     |
//! | `Timestamp` | `DateTime<Utc>`                                           |
//! | `Json`      | `serde_json::Value`                                       |
//! | `Array`     | `Vec<i64>`, `Vec<f64>`, `Vec<bool>`, `Vec<String>`, ...   |
//! | `Null`      | `Option<T>`, [`Nullable<T>`], byte and array vectors      |
//!
//! Anything else is a [`ScanError`](crate::error::ScanError).

use crate::error::{Error, Result, ScanError};
use crate::value::{ToValue, Value};
use chrono::{DateTime, Utc};

/// Decode a [`Value`] into a new instance of `Self`.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

/// Decode a [`Value`] into an existing destination.
///
/// This trait is object safe; record scanning works on
/// `&mut dyn ScanValue` pointers into record fields.
pub trait ScanValue {
    fn scan_value(&mut self, value: &Value) -> Result<()>;
}

impl<T: FromValue> ScanValue for T {
    fn scan_value(&mut self, value: &Value) -> Result<()> {
        *self = T::from_value(value)?;
        Ok(())
    }
}

/// A value paired with a validity flag.
///
/// Scanning NULL clears `valid` and resets `value` to its default; any
/// other value is decoded into `value` and sets `valid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Nullable<T> {
    pub value: T,
    pub valid: bool,
}

impl<T> Nullable<T> {
    pub const fn new(value: T) -> Self {
        Self { value, valid: true }
    }

    pub fn null() -> Self
    where
        T: Default,
    {
        Self {
            value: T::default(),
            valid: false,
        }
    }

    pub fn as_option(&self) -> Option<&T> {
        self.valid.then_some(&self.value)
    }

    pub fn into_option(self) -> Option<T> {
        self.valid.then_some(self.value)
    }
}

impl<T> From<Option<T>> for Nullable<T>
where
    T: Default,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Nullable::new(v),
            None => Nullable::null(),
        }
    }
}

impl<T: FromValue + Default> FromValue for Nullable<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Nullable::null());
        }
        T::from_value(value).map(Nullable::new)
    }
}

impl<T: ToValue> ToValue for Nullable<T> {
    fn to_value(&self) -> Value {
        if self.valid {
            self.value.to_value()
        } else {
            Value::Null
        }
    }
}

// ============================================================================
// Scalars
// ============================================================================

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => Err(Error::scan("bool", other)),
        }
    }
}

macro_rules! impl_from_value_number {
    ($($ty:ty),*) => {$(
        impl FromValue for $ty {
            fn from_value(value: &Value) -> Result<Self> {
                match value {
                    Value::BigInt(v) => Ok(*v as $ty),
                    Value::Double(v) => Ok(*v as $ty),
                    other => Err(Error::scan(stringify!($ty), other)),
                }
            }
        }
    )*};
}

impl_from_value_number!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            Value::Bytes(b) => String::from_utf8(b.clone()).map_err(|e| {
                Error::Scan(ScanError {
                    expected: "String",
                    found: "Bytes",
                    column: None,
                    message: Some(e.to_string()),
                })
            }),
            other => Err(Error::scan("String", other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            Value::Null => Ok(Vec::new()),
            other => Err(Error::scan("Vec<u8>", other)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Timestamp(t) => Ok(*t),
            Value::Text(s) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    Error::Scan(ScanError {
                        expected: "DateTime<Utc>",
                        found: "Text",
                        column: None,
                        message: Some(e.to_string()),
                    })
                }),
            other => Err(Error::scan("DateTime<Utc>", other)),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self> {
        let parse = |bytes: &[u8], found: &'static str| {
            serde_json::from_slice(bytes).map_err(|e| {
                Error::Scan(ScanError {
                    expected: "serde_json::Value",
                    found,
                    column: None,
                    message: Some(e.to_string()),
                })
            })
        };
        match value {
            Value::Json(j) => Ok(j.clone()),
            Value::Null => Ok(serde_json::Value::Null),
            Value::Text(s) => parse(s.as_bytes(), "Text"),
            Value::Bytes(b) => parse(b, "Bytes"),
            other => Err(Error::scan("serde_json::Value", other)),
        }
    }
}

// ============================================================================
// Arrays
// ============================================================================

macro_rules! impl_from_value_array {
    ($($ty:ty),*) => {$(
        impl FromValue for Vec<$ty> {
            fn from_value(value: &Value) -> Result<Self> {
                match value {
                    Value::Array(items) => items.iter().map(<$ty>::from_value).collect(),
                    Value::Null => Ok(Vec::new()),
                    other => Err(Error::scan(concat!("Vec<", stringify!($ty), ">"), other)),
                }
            }
        }
    )*};
}

impl_from_value_array!(i32, i64, f64, bool, String, Value);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widening_and_narrowing() {
        assert_eq!(i32::from_value(&Value::BigInt(42)).unwrap(), 42);
        assert_eq!(u8::from_value(&Value::BigInt(7)).unwrap(), 7);
        assert_eq!(f64::from_value(&Value::BigInt(3)).unwrap(), 3.0);
        assert_eq!(i64::from_value(&Value::Double(3.9)).unwrap(), 3);
    }

    #[test]
    fn test_bool_only_from_bool() {
        assert!(bool::from_value(&Value::Bool(true)).unwrap());
        assert!(bool::from_value(&Value::BigInt(1)).is_err());
    }

    #[test]
    fn test_bytes_string_duality() {
        assert_eq!(
            String::from_value(&Value::Bytes(b"hi".to_vec())).unwrap(),
            "hi"
        );
        assert_eq!(
            Vec::<u8>::from_value(&Value::Text("hi".into())).unwrap(),
            b"hi".to_vec()
        );
        assert!(String::from_value(&Value::Bytes(vec![0xff, 0xfe])).is_err());
    }

    #[test]
    fn test_null_handling() {
        assert_eq!(Option::<i64>::from_value(&Value::Null).unwrap(), None);
        assert_eq!(Vec::<u8>::from_value(&Value::Null).unwrap(), Vec::<u8>::new());
        assert_eq!(Vec::<i64>::from_value(&Value::Null).unwrap(), Vec::<i64>::new());
        assert!(i64::from_value(&Value::Null).is_err());
        assert!(String::from_value(&Value::Null).is_err());
    }

    #[test]
    fn test_nullable_scan() {
        let mut n = Nullable::new(5_i64);
        n.scan_value(&Value::Null).unwrap();
        assert!(!n.valid);
        assert_eq!(n.value, 0);

        n.scan_value(&Value::BigInt(9)).unwrap();
        assert_eq!(n, Nullable::new(9));
        assert_eq!(n.to_value(), Value::BigInt(9));
        assert_eq!(Nullable::<i64>::null().to_value(), Value::Null);
    }

    #[test]
    fn test_timestamp_and_json() {
        let ts = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(DateTime::<Utc>::from_value(&Value::Timestamp(ts)).unwrap(), ts);
        assert_eq!(
            DateTime::<Utc>::from_value(&Value::Text("2024-01-02T03:04:05Z".into())).unwrap(),
            ts
        );
        let json = serde_json::Value::from_value(&Value::Bytes(br#"{"a":1}"#.to_vec())).unwrap();
        assert_eq!(json["a"], 1);
    }

    #[test]
    fn test_array_scan() {
        let v = Value::Array(vec![Value::BigInt(1), Value::BigInt(2)]);
        assert_eq!(Vec::<i64>::from_value(&v).unwrap(), vec![1, 2]);
        assert!(Vec::<bool>::from_value(&v).is_err());
    }

    #[test]
    fn test_custom_scanner_through_dyn() {
        struct Upper(String);
        impl ScanValue for Upper {
            fn scan_value(&mut self, value: &Value) -> Result<()> {
                self.0 = String::from_value(value)?.to_uppercase();
                Ok(())
            }
        }

        let mut dest = Upper(String::new());
        let target: &mut dyn ScanValue = &mut dest;
        target.scan_value(&Value::Text("abc".into())).unwrap();
        assert_eq!(dest.0, "ABC");
    }
}
