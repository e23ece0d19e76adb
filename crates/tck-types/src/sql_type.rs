use std::fmt;

use serde::{Deserialize, Serialize};

/// Driver-reported column type, numbered like `java.sql.Types`.
///
/// Drivers report these codes in result metadata and expectations declare them
/// in `types(...)`. The numeric codes keep messages comparable with reports
/// from JDBC-based kits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SqlType {
    Bit,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    Real,
    Double,
    Numeric,
    Decimal,
    Char,
    VarChar,
    LongVarChar,
    Date,
    Time,
    Timestamp,
    Binary,
    VarBinary,
    Null,
    Boolean,
    /// "Don't verify" sentinel: any value passes the class check.
    Other,
}

impl SqlType {
    /// All known type codes.
    pub const ALL: [Self; 21] = [
        Self::Bit,
        Self::TinyInt,
        Self::SmallInt,
        Self::Integer,
        Self::BigInt,
        Self::Float,
        Self::Real,
        Self::Double,
        Self::Numeric,
        Self::Decimal,
        Self::Char,
        Self::VarChar,
        Self::LongVarChar,
        Self::Date,
        Self::Time,
        Self::Timestamp,
        Self::Binary,
        Self::VarBinary,
        Self::Null,
        Self::Boolean,
        Self::Other,
    ];

    /// The `java.sql.Types` integer code.
    pub const fn code(self) -> i32 {
        match self {
            Self::Bit => -7,
            Self::TinyInt => -6,
            Self::SmallInt => 5,
            Self::Integer => 4,
            Self::BigInt => -5,
            Self::Float => 6,
            Self::Real => 7,
            Self::Double => 8,
            Self::Numeric => 2,
            Self::Decimal => 3,
            Self::Char => 1,
            Self::VarChar => 12,
            Self::LongVarChar => -1,
            Self::Date => 91,
            Self::Time => 92,
            Self::Timestamp => 93,
            Self::Binary => -2,
            Self::VarBinary => -3,
            Self::Null => 0,
            Self::Boolean => 16,
            Self::Other => 1111,
        }
    }

    /// Look up a type by its integer code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Types whose values are rendered through the grouping decimal formatter.
    pub const fn is_formatted_numeric(self) -> bool {
        matches!(
            self,
            Self::Double
                | Self::Decimal
                | Self::Numeric
                | Self::BigInt
                | Self::Integer
                | Self::SmallInt
        )
    }

    /// Upper-case SQL name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bit => "BIT",
            Self::TinyInt => "TINYINT",
            Self::SmallInt => "SMALLINT",
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Float => "FLOAT",
            Self::Real => "REAL",
            Self::Double => "DOUBLE",
            Self::Numeric => "NUMERIC",
            Self::Decimal => "DECIMAL",
            Self::Char => "CHAR",
            Self::VarChar => "VARCHAR",
            Self::LongVarChar => "LONGVARCHAR",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::Timestamp => "TIMESTAMP",
            Self::Binary => "BINARY",
            Self::VarBinary => "VARBINARY",
            Self::Null => "NULL",
            Self::Boolean => "BOOLEAN",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}
