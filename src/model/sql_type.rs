use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared store column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Boolean,
    Integer,
    BigInt,
    Double,
    Decimal,
    VarChar,
    DateTime,
    #[default]
    Unknown,
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE",
            SqlType::Decimal => "DECIMAL",
            SqlType::VarChar => "VARCHAR",
            SqlType::DateTime => "TIMESTAMP",
            SqlType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}
