//! Column types and runtime values.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use uuid::Uuid;

/// Storable column type. Each variant has a stable textual tag used by
/// schema dumps, so renaming a variant is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int,
    BigInt,
    Float,
    Bool,
    Text,
    Bytes,
    Timestamp,
    Date,
    Time,
    Interval,
    Uuid,
    Json,
    /// Enumeration stored as its integer discriminant.
    IntEnum,
    /// Enumeration stored as its textual name.
    TextEnum,
}

impl FieldType {
    pub fn tag(&self) -> &'static str {
        match self {
            FieldType::Int => "int",
            FieldType::BigInt => "bigint",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::Text => "text",
            FieldType::Bytes => "bytes",
            FieldType::Timestamp => "timestamp",
            FieldType::Date => "date",
            FieldType::Time => "time",
            FieldType::Interval => "interval",
            FieldType::Uuid => "uuid",
            FieldType::Json => "json",
            FieldType::IntEnum => "int_enum",
            FieldType::TextEnum => "text_enum",
        }
    }

    pub fn from_tag(tag: &str) -> Option<FieldType> {
        Some(match tag {
            "int" => FieldType::Int,
            "bigint" => FieldType::BigInt,
            "float" => FieldType::Float,
            "bool" => FieldType::Bool,
            "text" => FieldType::Text,
            "bytes" => FieldType::Bytes,
            "timestamp" => FieldType::Timestamp,
            "date" => FieldType::Date,
            "time" => FieldType::Time,
            "interval" => FieldType::Interval,
            "uuid" => FieldType::Uuid,
            "json" => FieldType::Json,
            "int_enum" => FieldType::IntEnum,
            "text_enum" => FieldType::TextEnum,
            _ => return None,
        })
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A runtime value bound as a query argument or row cell.
///
/// Equality is structural; the query argument table relies on it to
/// dedup repeated bindings of the same value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Interval(Duration),
    Uuid(Uuid),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The column type this value naturally maps to, if any.
    pub fn field_type(&self) -> Option<FieldType> {
        Some(match self {
            Value::Null => return None,
            Value::Bool(_) => FieldType::Bool,
            Value::Int(_) => FieldType::BigInt,
            Value::Float(_) => FieldType::Float,
            Value::Text(_) => FieldType::Text,
            Value::Bytes(_) => FieldType::Bytes,
            Value::Timestamp(_) => FieldType::Timestamp,
            Value::Date(_) => FieldType::Date,
            Value::Time(_) => FieldType::Time,
            Value::Interval(_) => FieldType::Interval,
            Value::Uuid(_) => FieldType::Uuid,
            Value::Json(_) => FieldType::Json,
        })
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Value {
        Value::Timestamp(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Value {
        Value::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Value {
        Value::Time(v)
    }
}

impl From<Duration> for Value {
    fn from(v: Duration) -> Value {
        Value::Interval(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Value {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Value {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Value {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for ty in [
            FieldType::Int,
            FieldType::BigInt,
            FieldType::Float,
            FieldType::Bool,
            FieldType::Text,
            FieldType::Bytes,
            FieldType::Timestamp,
            FieldType::Date,
            FieldType::Time,
            FieldType::Interval,
            FieldType::Uuid,
            FieldType::Json,
            FieldType::IntEnum,
            FieldType::TextEnum,
        ] {
            assert_eq!(FieldType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(FieldType::from_tag("decimal"), None);
    }

    #[test]
    fn value_equality_dedups() {
        assert_eq!(Value::from(5), Value::from(5i64));
        assert_ne!(Value::from(5), Value::from("5"));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn value_type_inference() {
        assert_eq!(Value::from("x").field_type(), Some(FieldType::Text));
        assert_eq!(Value::Null.field_type(), None);
    }
}
