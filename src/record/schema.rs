use std::fmt;

/// Declared type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Bool,
    /// Point in time, ordered chronologically.
    Timestamp,
    /// Closed set of values. Ranked enums order by declaration index,
    /// unranked enums order lexically.
    Enum {
        variants: &'static [&'static str],
        ranked: bool,
    },
    /// Nested object with its own declared fields.
    Object(&'static [FieldDef]),
    /// Sequence of values with no defined total order.
    List,
    /// String-keyed map with no defined total order.
    Map,
}

impl FieldType {
    /// Returns true when values of this type can be compared and sorted.
    pub fn is_orderable(&self) -> bool {
        !matches!(self, Self::Object(_) | Self::List | Self::Map)
    }

    /// Returns the type name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
            Self::Enum { .. } => "enum",
            Self::Object(_) => "object",
            Self::List => "list",
            Self::Map => "map",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single named field in a record schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub ty: FieldType,
    /// Required fields must be present and non-null on the wire.
    pub required: bool,
}

impl FieldDef {
    pub const fn required(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
        }
    }
}

/// Looks up a field by name, returning its index within `fields`.
pub fn lookup(fields: &'static [FieldDef], name: &str) -> Option<(usize, &'static FieldDef)> {
    fields.iter().enumerate().find(|(_, def)| def.name == name)
}

/// Field schema of one record kind, rooted at a single top-level key.
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
    /// Top-level key of the wire object and first segment of every path.
    pub root: &'static str,
    pub fields: &'static [FieldDef],
}

/// Log levels in ascending severity.
pub const LOG_LEVELS: &[&str] = &["TRACE", "DEBUG", "INFO", "WARN", "ERROR", "FATAL"];

/// Profile kinds, unranked.
pub const PROFILE_KINDS: &[&str] = &["alloc", "cpu", "lock", "wall"];

/// Node health states, ranked so healthy nodes sort first.
pub const NODE_STATUSES: &[&str] = &["UP", "DOWN", "UNKNOWN"];

pub static LOG_SCHEMA: Schema = Schema {
    root: "log",
    fields: &[
        FieldDef::required("ts", FieldType::Timestamp),
        FieldDef::required(
            "level",
            FieldType::Enum {
                variants: LOG_LEVELS,
                ranked: true,
            },
        ),
        FieldDef::required("logger", FieldType::String),
        FieldDef::required("thread", FieldType::String),
        FieldDef::required("message", FieldType::String),
        FieldDef::required("node", FieldType::String),
        FieldDef::optional("exception", FieldType::String),
        FieldDef::optional("mdc", FieldType::Map),
    ],
};

pub static PROFILE_SCHEMA: Schema = Schema {
    root: "profile",
    fields: &[
        FieldDef::required("ts", FieldType::Timestamp),
        FieldDef::required("node", FieldType::String),
        FieldDef::required(
            "kind",
            FieldType::Enum {
                variants: PROFILE_KINDS,
                ranked: false,
            },
        ),
        FieldDef::required("duration_ms", FieldType::Integer),
        FieldDef::required("samples", FieldType::Integer),
        FieldDef::optional("format", FieldType::String),
        FieldDef::optional("frames", FieldType::List),
    ],
};

pub static NODE_SCHEMA: Schema = Schema {
    root: "node",
    fields: &[
        FieldDef::required("id", FieldType::String),
        FieldDef::required("host", FieldType::String),
        FieldDef::required("port", FieldType::Integer),
        FieldDef::required(
            "status",
            FieldType::Enum {
                variants: NODE_STATUSES,
                ranked: true,
            },
        ),
        FieldDef::optional("version", FieldType::String),
        FieldDef::optional("started_at", FieldType::Timestamp),
        FieldDef::optional("metadata", FieldType::Map),
    ],
};
