use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};

/// Comparable scalar extracted from a record field.
///
/// Values produced from the same field always share a variant, except for
/// `Null` which stands in for an absent optional field and orders before
/// every other value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    /// Enum value with its rank (zero for unranked enums) and canonical name.
    Enum { rank: u32, name: &'static str },
    Str(String),
}

impl Value {
    fn variant_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Float(_) => 3,
            Self::Timestamp(_) => 4,
            Self::Enum { .. } => 5,
            Self::Str(_) => 6,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (
                Self::Enum {
                    rank: ra,
                    name: na,
                },
                Self::Enum {
                    rank: rb,
                    name: nb,
                },
            ) => ra.cmp(rb).then_with(|| na.cmp(nb)),
            // UTF-8 byte order is code point order.
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            _ => self.variant_rank().cmp(&other.variant_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Self::Enum { name, .. } => f.write_str(name),
            Self::Str(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_orders_first() {
        assert!(Value::Null < Value::Int(i64::MIN));
        assert!(Value::Null < Value::Str(String::new()));
    }

    #[test]
    fn test_ranked_enum_orders_by_rank() {
        let warn = Value::Enum {
            rank: 3,
            name: "WARN",
        };
        let error = Value::Enum {
            rank: 4,
            name: "ERROR",
        };
        assert!(warn < error);
    }

    #[test]
    fn test_unranked_enum_orders_lexically() {
        let cpu = Value::Enum {
            rank: 0,
            name: "cpu",
        };
        let alloc = Value::Enum {
            rank: 0,
            name: "alloc",
        };
        assert!(alloc < cpu);
    }

    #[test]
    fn test_strings_order_by_code_point() {
        assert!(Value::Str("Z".into()) < Value::Str("a".into()));
        assert!(Value::Str("a".into()) < Value::Str("\u{e9}".into()));
    }

    #[test]
    fn test_float_nan_is_equal_to_itself() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert!(Value::Float(1.0) < Value::Float(f64::NAN));
    }
}
