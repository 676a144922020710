use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt::{self, Write};

use super::{compile, CompiledExpression, ExprError, Value};
use crate::record::{coerce_json, Record, RecordKind};

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Operator spellings, two-character forms first so `<=` is not read as `<`.
const OPERATORS: &[(&str, Comparison)] = &[
    ("==", Comparison::Eq),
    ("!=", Comparison::Ne),
    ("<=", Comparison::Le),
    (">=", Comparison::Ge),
    ("=", Comparison::Eq),
    ("<", Comparison::Lt),
    (">", Comparison::Gt),
];

impl Comparison {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    /// Returns whether `lhs <op> rhs` holds given `lhs.cmp(rhs)`.
    pub fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

/// A single `<path> <op> <literal>` predicate, e.g. `log.level >= WARN`.
///
/// The literal is coerced into the field's domain at compile time, so a
/// filter that compiles can be evaluated against any conforming record.
#[derive(Debug, Clone)]
pub struct Filter {
    expr: CompiledExpression,
    op: Comparison,
    literal: Value,
}

impl Filter {
    pub fn compile(source: &str, kind: RecordKind) -> Result<Self, ExprError> {
        let invalid = |reason: String| ExprError::InvalidFilter {
            expr: source.to_string(),
            reason,
        };

        let (pos, symbol, op) =
            find_operator(source).ok_or_else(|| invalid("missing comparison operator".into()))?;

        let path = source.get(..pos).unwrap_or_default().trim();
        let literal = source
            .get(pos + symbol.len()..)
            .unwrap_or_default()
            .trim();
        let literal = unquote(literal);

        if path.is_empty() {
            return Err(invalid("missing field path".into()));
        }
        if literal.is_empty() {
            return Err(invalid("missing comparison value".into()));
        }

        let expr = compile(path, kind)?;
        let literal = coerce_json(
            &expr.field_type(),
            &serde_json::Value::String(literal.to_string()),
        )
        .ok_or_else(|| {
            invalid(format!(
                "{literal:?} is not a valid {} value for {path}",
                expr.field_type()
            ))
        })?;

        Ok(Self { expr, op, literal })
    }

    /// Evaluates the predicate against `record`.
    pub fn matches(&self, record: &Record) -> bool {
        self.op.holds(self.expr.extract(record).cmp(&self.literal))
    }

    pub fn expr(&self) -> &CompiledExpression {
        &self.expr
    }

    pub fn op(&self) -> Comparison {
        self.op
    }
}

/// Canonical textual form, suitable for forwarding to peers.
///
/// String literals are double-quoted with `"` and `\` backslash-escaped,
/// which [`Filter::compile`] reads back to the same literal.
impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ", self.expr.path(), self.op.symbol())?;
        match &self.literal {
            Value::Str(s) => {
                f.write_char('"')?;
                for c in s.chars() {
                    if matches!(c, '"' | '\\') {
                        f.write_char('\\')?;
                    }
                    f.write_char(c)?;
                }
                f.write_char('"')
            }
            other => write!(f, "{other}"),
        }
    }
}

/// Finds the leftmost operator in `source`.
fn find_operator(source: &str) -> Option<(usize, &'static str, Comparison)> {
    source.char_indices().find_map(|(pos, _)| {
        let rest = source.get(pos..)?;
        OPERATORS
            .iter()
            .find(|(symbol, _)| rest.starts_with(symbol))
            .map(|&(symbol, op)| (pos, symbol, op))
    })
}

/// Strips one layer of quotes. Single-quoted text is taken verbatim. Inside
/// double quotes `\"` and `\\` are unescaped. Any other backslash is literal.
fn unquote(s: &str) -> Cow<'_, str> {
    if let Some(inner) = s.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')) {
        return Cow::Borrowed(inner);
    }
    let Some(inner) = s.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) else {
        return Cow::Borrowed(s);
    };
    if !inner.contains('\\') {
        return Cow::Borrowed(inner);
    }

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek().filter(|&&next| next == '"' || next == '\\') {
                out.push(next);
                chars.next();
                continue;
            }
        }
        out.push(c);
    }
    Cow::Owned(out)
}
