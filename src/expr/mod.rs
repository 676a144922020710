pub mod filter;
mod value;

use std::cmp;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::schema::{self, FieldType};
use crate::record::{Record, RecordKind};

pub use self::filter::{Comparison, Filter};
pub use self::value::Value;

/// Errors raised while compiling expressions against a record schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("unknown field {path:?} for {kind} records")]
    UnknownField { kind: RecordKind, path: String },

    #[error("field {path:?} has type {field_type}, which has no total order")]
    UnsupportedFieldType {
        path: String,
        field_type: &'static str,
    },

    #[error("invalid filter {expr:?}: {reason}")]
    InvalidFilter { expr: String, reason: String },

    #[error("expression compiled for {expected} records applied to {actual} records")]
    KindMismatch {
        expected: RecordKind,
        actual: RecordKind,
    },
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    /// Applies the direction to an ascending comparison result.
    pub fn apply(self, ordering: cmp::Ordering) -> cmp::Ordering {
        match self {
            Self::Asc => ordering,
            Self::Desc => ordering.reverse(),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Asc),
            "desc" | "descending" => Ok(Self::Desc),
            other => Err(format!("invalid direction {other:?} (expected asc or desc)")),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => f.write_str("asc"),
            Self::Desc => f.write_str("desc"),
        }
    }
}

/// A field path resolved against one record kind's schema.
///
/// Holds the declaration index of each path segment, so extraction is a
/// direct walk with no name lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledExpression {
    kind: RecordKind,
    path: String,
    steps: Vec<usize>,
    field_type: FieldType,
}

/// Compiles a dotted field path such as `log.ts` for `kind`.
///
/// The first segment must name the schema root. Every later segment must be
/// a declared field, and the terminal field must be orderable.
pub fn compile(path: &str, kind: RecordKind) -> Result<CompiledExpression, ExprError> {
    let schema = kind.schema();
    let unknown = || ExprError::UnknownField {
        kind,
        path: path.to_string(),
    };

    let mut segments = path.trim().split('.');
    if segments.next() != Some(schema.root) {
        return Err(unknown());
    }

    let mut fields = Some(schema.fields);
    let mut steps = Vec::new();
    let mut terminal = None;

    for segment in segments {
        let (idx, def) = fields
            .and_then(|fields| schema::lookup(fields, segment))
            .ok_or_else(unknown)?;

        steps.push(idx);
        fields = match def.ty {
            FieldType::Object(inner) => Some(inner),
            _ => None,
        };
        terminal = Some(def.ty);
    }

    let field_type = terminal.ok_or_else(unknown)?;
    if !field_type.is_orderable() {
        return Err(ExprError::UnsupportedFieldType {
            path: path.to_string(),
            field_type: field_type.name(),
        });
    }

    Ok(CompiledExpression {
        kind,
        path: path.trim().to_string(),
        steps,
        field_type,
    })
}

impl CompiledExpression {
    /// Extracts the comparable value of this field from `record`.
    ///
    /// `record` must be of the kind this expression was compiled for; callers
    /// check that once per batch with [`CompiledExpression::check_kind`].
    pub fn extract(&self, record: &Record) -> Value {
        record.value_at(&self.steps)
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Fails unless this expression applies to records of `kind`.
    pub fn check_kind(&self, kind: RecordKind) -> Result<(), ExprError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(ExprError::KindMismatch {
                expected: self.kind,
                actual: kind,
            })
        }
    }
}

/// Total order over records of one kind: a compiled field plus a direction.
#[derive(Debug, Clone)]
pub struct SortOrder {
    expr: CompiledExpression,
    direction: Direction,
}

impl SortOrder {
    pub fn new(expr: CompiledExpression, direction: Direction) -> Self {
        Self { expr, direction }
    }

    pub fn expr(&self) -> &CompiledExpression {
        &self.expr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Extracts the sort key of `record`.
    pub fn key(&self, record: &Record) -> Value {
        self.expr.extract(record)
    }

    /// Compares two already-extracted keys in this order's direction.
    pub fn compare_keys(&self, a: &Value, b: &Value) -> cmp::Ordering {
        self.direction.apply(a.cmp(b))
    }

    /// Compares two records in this order's direction.
    pub fn compare(&self, a: &Record, b: &Record) -> cmp::Ordering {
        self.compare_keys(&self.key(a), &self.key(b))
    }
}
