//! Dynamically-typed field values.
//!
//! Entities expose their persistent state as `Value`s so the unit of work
//! can snapshot, diff, and hash them without knowing concrete field types.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A dynamically-typed persistent field value.
///
/// This enum covers the scalar shapes the change-set computer and the
/// persister gateway exchange. It is deliberately storage-agnostic: how a
/// value maps to a column type is the persister's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL / absent value
    Null,

    /// Boolean value
    Bool(bool),

    /// 8-bit signed integer
    TinyInt(i8),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Time (microseconds since midnight)
    Time(i64),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// Timestamp with timezone (microseconds since epoch, UTC)
    TimestampTz(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),

    /// Array of values
    Array(Vec<Value>),
}

/// The semantic type of a persistent field.
///
/// Drives the loose equality used by the change-set computer: a date-time is
/// compared by instant regardless of which timestamp variant carries it, and
/// integers compare across widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// Boolean field
    Bool,
    /// Integer field of any width
    Integer,
    /// Floating-point field of any precision
    Float,
    /// Arbitrary-precision decimal field
    Decimal,
    /// Text field
    Text,
    /// Binary field
    Bytes,
    /// Calendar date field
    Date,
    /// Time-of-day field
    Time,
    /// Instant field (timestamp with or without zone)
    DateTime,
    /// UUID field
    Uuid,
    /// JSON document field
    Json,
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::TimestampTz(_) => "TIMESTAMPTZ",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
            Value::Array(_) => "ARRAY",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::TinyInt(v) => Some(*v != 0),
            Value::SmallInt(v) => Some(*v != 0),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::TinyInt(v) => Some(f64::from(*v)),
            Value::SmallInt(v) => Some(f64::from(*v)),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// The microsecond instant carried by a timestamp variant.
    pub fn as_instant_micros(&self) -> Option<i64> {
        match self {
            Value::Timestamp(ts) | Value::TimestampTz(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::TinyInt(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
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

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Compare two values with the loose equality appropriate to a field's
/// semantic type.
///
/// Strict `PartialEq` on `Value` distinguishes `Int(1)` from `BigInt(1)` and
/// `Timestamp(t)` from `TimestampTz(t)`; the change-set computer must not,
/// or a reload through a different persister would make every row dirty.
pub fn loosely_equal(a: &Value, b: &Value, ty: FieldType) -> bool {
    if a.is_null() || b.is_null() {
        return a.is_null() && b.is_null();
    }

    match ty {
        FieldType::Bool => a.as_bool() == b.as_bool(),
        FieldType::Integer => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        FieldType::Float => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.to_bits() == y.to_bits(),
            _ => a == b,
        },
        FieldType::Decimal => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.to_bits() == y.to_bits(),
            _ => a == b,
        },
        FieldType::DateTime => match (a.as_instant_micros(), b.as_instant_micros()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        FieldType::Text
        | FieldType::Bytes
        | FieldType::Date
        | FieldType::Time
        | FieldType::Uuid
        | FieldType::Json => a == b,
    }
}

/// Hash a slice of identifier values into a stable composite key.
///
/// Used by the identity map and the cache regions. Numeric variants hash
/// width-normalized so a `BigInt(1)` lookup finds an identity that was
/// hydrated as `Int(1)`.
pub fn hash_identity(values: &[Value]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    values.len().hash(&mut hasher);
    for v in values {
        hash_value(v, &mut hasher);
    }
    hasher.finish()
}

/// Hash a single value into the hasher.
pub fn hash_value(v: &Value, hasher: &mut impl Hasher) {
    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        // All integer widths hash alike (see module docs).
        Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
            2u8.hash(hasher);
            v.as_i64().hash(hasher);
        }
        Value::Float(f) => {
            3u8.hash(hasher);
            f64::from(*f).to_bits().hash(hasher);
        }
        Value::Double(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Decimal(s) => {
            4u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Text(s) => {
            5u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            6u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Date(d) => {
            7u8.hash(hasher);
            d.hash(hasher);
        }
        Value::Time(t) => {
            8u8.hash(hasher);
            t.hash(hasher);
        }
        Value::Timestamp(ts) | Value::TimestampTz(ts) => {
            9u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::Uuid(u) => {
            10u8.hash(hasher);
            u.hash(hasher);
        }
        Value::Json(j) => {
            11u8.hash(hasher);
            j.to_string().hash(hasher);
        }
        Value::Array(arr) => {
            12u8.hash(hasher);
            arr.len().hash(hasher);
            for item in arr {
                hash_value(item, hasher);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_checks() {
        assert!(Value::Null.is_null());
        assert!(!Value::Int(0).is_null());
    }

    #[test]
    fn test_integer_conversions() {
        assert_eq!(Value::TinyInt(5).as_i64(), Some(5));
        assert_eq!(Value::BigInt(-3).as_i64(), Some(-3));
        assert_eq!(Value::Text("x".to_string()).as_i64(), None);
    }

    #[test]
    fn test_from_option() {
        assert_eq!(Value::from(Some(7_i64)), Value::BigInt(7));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_loose_equality_integers_across_widths() {
        assert!(loosely_equal(
            &Value::Int(42),
            &Value::BigInt(42),
            FieldType::Integer
        ));
        assert!(!loosely_equal(
            &Value::Int(42),
            &Value::BigInt(43),
            FieldType::Integer
        ));
    }

    #[test]
    fn test_loose_equality_datetime_by_instant() {
        assert!(loosely_equal(
            &Value::Timestamp(1_000_000),
            &Value::TimestampTz(1_000_000),
            FieldType::DateTime
        ));
        assert!(!loosely_equal(
            &Value::Timestamp(1_000_000),
            &Value::TimestampTz(2_000_000),
            FieldType::DateTime
        ));
    }

    #[test]
    fn test_loose_equality_null_only_matches_null() {
        assert!(loosely_equal(&Value::Null, &Value::Null, FieldType::Text));
        assert!(!loosely_equal(
            &Value::Null,
            &Value::Text(String::new()),
            FieldType::Text
        ));
    }

    #[test]
    fn test_identity_hash_stable_and_discriminating() {
        let a = vec![Value::BigInt(1), Value::Text("a".to_string())];
        let b = vec![Value::BigInt(1), Value::Text("a".to_string())];
        let c = vec![Value::BigInt(1), Value::Text("b".to_string())];

        assert_eq!(hash_identity(&a), hash_identity(&b));
        assert_ne!(hash_identity(&a), hash_identity(&c));
    }

    #[test]
    fn test_identity_hash_normalizes_integer_widths() {
        assert_eq!(
            hash_identity(&[Value::Int(9)]),
            hash_identity(&[Value::BigInt(9)])
        );
    }
}
