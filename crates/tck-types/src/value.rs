use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single value returned by a driver.
///
/// Variants mirror the object classes a JDBC driver hands back from
/// `getObject`, so type expectations can check the runtime class of a value
/// and not only the declared column type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Double(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
}

/// Runtime class of a non-null [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Boolean,
    Byte,
    Short,
    Integer,
    Long,
    Double,
    BigDecimal,
    String,
    Bytes,
}

impl Value {
    /// The runtime class, or `None` for SQL NULL.
    pub const fn kind(&self) -> Option<ValueKind> {
        match self {
            Self::Null => None,
            Self::Boolean(_) => Some(ValueKind::Boolean),
            Self::TinyInt(_) => Some(ValueKind::Byte),
            Self::SmallInt(_) => Some(ValueKind::Short),
            Self::Integer(_) => Some(ValueKind::Integer),
            Self::BigInt(_) => Some(ValueKind::Long),
            Self::Double(_) => Some(ValueKind::Double),
            Self::Decimal(_) => Some(ValueKind::BigDecimal),
            Self::Text(_) => Some(ValueKind::String),
            Self::Bytes(_) => Some(ValueKind::Bytes),
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convenience constructor for text values.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Boolean => "Boolean",
            Self::Byte => "Byte",
            Self::Short => "Short",
            Self::Integer => "Integer",
            Self::Long => "Long",
            Self::Double => "Double",
            Self::BigDecimal => "BigDecimal",
            Self::String => "String",
            Self::Bytes => "byte[]",
        })
    }
}

/// Default string form of a value; `NULL` prints as `null`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::TinyInt(v) => write!(f, "{v}"),
            Self::SmallInt(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::BigInt(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v:?}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Text(s) => f.write_str(s),
            Self::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::BigInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rust_decimal::Decimal;

    use super::{Value, ValueKind};

    #[test]
    fn null_has_no_kind_and_prints_null() {
        assert_eq!(Value::Null.kind(), None);
        assert_eq!(Value::Null.to_string(), "null");
    }

    #[test]
    fn default_string_forms() {
        assert_eq!(Value::from(true).to_string(), "true");
        assert_eq!(Value::from(42_i64).to_string(), "42");
        assert_eq!(Value::from(2.0_f64).to_string(), "2.0");
        assert_eq!(Value::from("Beer").to_string(), "Beer");
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).to_string(), "DEAD");
        let d = Decimal::from_str("12.50").expect("decimal literal");
        assert_eq!(Value::from(d).to_string(), "12.50");
    }

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(Value::BigInt(1).kind(), Some(ValueKind::Long));
        assert_eq!(Value::Integer(1).kind(), Some(ValueKind::Integer));
        assert_eq!(Value::TinyInt(1).kind(), Some(ValueKind::Byte));
        assert_eq!(Value::text("x").kind(), Some(ValueKind::String));
    }

    #[test]
    fn option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(3_i64)), Value::BigInt(3));
    }
}
