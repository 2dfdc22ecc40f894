use std::fmt;

use serde::{Deserialize, Serialize};

/// Host-side type of an expression.
///
/// `Entity` and `Record` carry the mapped entity / constructed type name so
/// that comparisons and relationship lookups can go back to the mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Long,
    Float,
    Decimal,
    String,
    DateTime,
    Entity(String),
    Record(String),
    Sequence(Box<ValueType>),
    Unknown,
}

impl ValueType {
    /// Types the parameterizer keeps inline as literals.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueType::Bool | ValueType::Int | ValueType::Long | ValueType::Float | ValueType::Decimal)
    }

    /// Types that can live in a single store column.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            ValueType::Bool
                | ValueType::Int
                | ValueType::Long
                | ValueType::Float
                | ValueType::Decimal
                | ValueType::String
                | ValueType::DateTime
        )
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, ValueType::Sequence(_))
    }

    pub fn sequence_of(element: ValueType) -> ValueType {
        ValueType::Sequence(Box::new(element))
    }

    pub fn element_type(&self) -> ValueType {
        match self {
            ValueType::Sequence(inner) => (**inner).clone(),
            other => other.clone(),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Bool => write!(f, "bool"),
            ValueType::Int => write!(f, "int"),
            ValueType::Long => write!(f, "long"),
            ValueType::Float => write!(f, "float"),
            ValueType::Decimal => write!(f, "decimal"),
            ValueType::String => write!(f, "string"),
            ValueType::DateTime => write!(f, "datetime"),
            ValueType::Entity(name) => write!(f, "entity<{name}>"),
            ValueType::Record(name) => write!(f, "record<{name}>"),
            ValueType::Sequence(inner) => write!(f, "seq<{inner}>"),
            ValueType::Unknown => write!(f, "?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_set_is_closed() {
        assert!(ValueType::Bool.is_numeric());
        assert!(ValueType::Decimal.is_numeric());
        assert!(!ValueType::String.is_numeric());
        assert!(!ValueType::DateTime.is_numeric());
    }

    #[test]
    fn sequence_element_type() {
        let seq = ValueType::sequence_of(ValueType::Entity("Order".into()));
        assert!(seq.is_sequence());
        assert!(!seq.is_scalar());
        assert_eq!(seq.element_type(), ValueType::Entity("Order".into()));
        assert_eq!(seq.to_string(), "seq<entity<Order>>");
    }
}
