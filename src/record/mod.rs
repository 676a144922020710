pub mod node;
pub mod schema;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::expr::Value;

use self::schema::{FieldDef, FieldType, Schema, LOG_SCHEMA, NODE_SCHEMA, PROFILE_SCHEMA};

/// Errors raised while mapping wire data onto a record schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("unknown record kind: {tag:?}")]
    UnknownRecordKind { tag: String },

    #[error("decoding {kind} record: {reason}")]
    Decode { kind: RecordKind, reason: String },
}

/// Closed set of record kinds served by peer actuators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Log,
    Profile,
    NodeInfo,
}

impl RecordKind {
    pub const ALL: &'static [RecordKind] = &[Self::Log, Self::Profile, Self::NodeInfo];

    /// Resolves a wire tag such as `"log"` to its record kind.
    pub fn from_tag(tag: &str) -> Result<Self, RecordError> {
        match tag {
            "log" => Ok(Self::Log),
            "profile" => Ok(Self::Profile),
            "nodeinfo" => Ok(Self::NodeInfo),
            _ => Err(RecordError::UnknownRecordKind {
                tag: tag.to_string(),
            }),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Profile => "profile",
            Self::NodeInfo => "nodeinfo",
        }
    }

    pub fn schema(&self) -> &'static Schema {
        match self {
            Self::Log => &LOG_SCHEMA,
            Self::Profile => &PROFILE_SCHEMA,
            Self::NodeInfo => &NODE_SCHEMA,
        }
    }

    /// Field path used when a query does not name a sort field.
    pub fn default_sort(&self) -> &'static str {
        match self {
            Self::Log => "log.ts",
            Self::Profile => "profile.ts",
            Self::NodeInfo => "node.id",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Decoded field, laid out in schema declaration order.
#[derive(Debug, Clone)]
enum Slot {
    Scalar(Value),
    Object(Vec<Slot>),
    /// Collection or absent optional object; carried only in the raw form.
    Opaque,
}

/// A record decoded against its kind's schema.
///
/// Keeps the original JSON for output and a typed view of every declared
/// scalar for extraction.
#[derive(Debug, Clone)]
pub struct Record {
    kind: RecordKind,
    slots: Vec<Slot>,
    raw: serde_json::Value,
}

impl Record {
    /// Decodes one wire object. Fails if a required field is missing or any
    /// present field does not match its declared type.
    pub fn decode(kind: RecordKind, raw: serde_json::Value) -> Result<Self, RecordError> {
        let schema = kind.schema();
        let root = raw
            .get(schema.root)
            .and_then(serde_json::Value::as_object)
            .ok_or_else(|| RecordError::Decode {
                kind,
                reason: format!("missing {:?} object", schema.root),
            })?;

        let slots = decode_fields(kind, schema.fields, root, schema.root)?;

        Ok(Self { kind, slots, raw })
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }

    /// Walks the slot tree along declaration indices.
    ///
    /// Conforming records resolve every compiled path; a step into an
    /// absent optional object yields `Null`.
    pub(crate) fn value_at(&self, steps: &[usize]) -> Value {
        let mut slots = &self.slots;
        let mut iter = steps.iter().peekable();

        while let Some(&idx) = iter.next() {
            match (slots.get(idx), iter.peek().is_some()) {
                (Some(Slot::Object(inner)), true) => slots = inner,
                (Some(Slot::Scalar(value)), false) => return value.clone(),
                _ => return Value::Null,
            }
        }

        Value::Null
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.raw == other.raw
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

fn decode_fields(
    kind: RecordKind,
    fields: &'static [FieldDef],
    object: &serde_json::Map<String, serde_json::Value>,
    prefix: &str,
) -> Result<Vec<Slot>, RecordError> {
    let mut slots = Vec::with_capacity(fields.len());

    for def in fields {
        let path = format!("{prefix}.{}", def.name);
        let value = object.get(def.name).filter(|v| !v.is_null());

        let Some(value) = value else {
            if def.required {
                return Err(RecordError::Decode {
                    kind,
                    reason: format!("missing required field {path}"),
                });
            }
            slots.push(match def.ty {
                FieldType::Object(_) | FieldType::List | FieldType::Map => Slot::Opaque,
                _ => Slot::Scalar(Value::Null),
            });
            continue;
        };

        let slot = match def.ty {
            FieldType::Object(inner) => {
                let nested = value.as_object().ok_or_else(|| RecordError::Decode {
                    kind,
                    reason: format!("{path} is not an object"),
                })?;
                Slot::Object(decode_fields(kind, inner, nested, &path)?)
            }
            FieldType::List => {
                if !value.is_array() {
                    return Err(RecordError::Decode {
                        kind,
                        reason: format!("{path} is not a list"),
                    });
                }
                Slot::Opaque
            }
            FieldType::Map => {
                if !value.is_object() {
                    return Err(RecordError::Decode {
                        kind,
                        reason: format!("{path} is not a map"),
                    });
                }
                Slot::Opaque
            }
            ty => {
                let scalar = coerce_json(&ty, value).ok_or_else(|| RecordError::Decode {
                    kind,
                    reason: format!("{path} value {value} is not a valid {ty}"),
                })?;
                Slot::Scalar(scalar)
            }
        };

        slots.push(slot);
    }

    Ok(slots)
}

/// Coerces a JSON value into the comparison domain of `ty`.
///
/// Accepts the native JSON form as well as the string form of every scalar
/// type, so filter literals and string-encoded wire numbers share one path.
/// Returns `None` for collection types and for values outside the domain.
pub fn coerce_json(ty: &FieldType, value: &serde_json::Value) -> Option<Value> {
    use serde_json::Value as Json;

    match (ty, value) {
        (FieldType::String, Json::String(s)) => Some(Value::Str(s.clone())),
        (FieldType::Integer, Json::Number(n)) => n.as_i64().map(Value::Int),
        (FieldType::Integer, Json::String(s)) => s.trim().parse().ok().map(Value::Int),
        (FieldType::Float, Json::Number(n)) => n.as_f64().map(Value::Float),
        (FieldType::Float, Json::String(s)) => s.trim().parse().ok().map(Value::Float),
        (FieldType::Bool, Json::Bool(b)) => Some(Value::Bool(*b)),
        (FieldType::Bool, Json::String(s)) => s.trim().parse().ok().map(Value::Bool),
        (FieldType::Timestamp, Json::Number(n)) => {
            n.as_i64().and_then(timestamp_from_millis)
        }
        (FieldType::Timestamp, Json::String(s)) => parse_timestamp(s.trim()),
        (FieldType::Enum { variants, ranked }, Json::String(s)) => {
            let s = s.trim();
            variants
                .iter()
                .position(|candidate| candidate.eq_ignore_ascii_case(s))
                .and_then(|idx| {
                    let name = variants.get(idx).copied()?;
                    let rank = if *ranked { u32::try_from(idx).ok()? } else { 0 };
                    Some(Value::Enum { rank, name })
                })
        }
        _ => None,
    }
}

fn timestamp_from_millis(ms: i64) -> Option<Value> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(Value::Timestamp)
}

fn parse_timestamp(s: &str) -> Option<Value> {
    if let Ok(ms) = s.parse::<i64>() {
        return timestamp_from_millis(ms);
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| Value::Timestamp(ts.with_timezone(&Utc)))
}

/// Decodes a peer response body: either an array of records or a single
/// record object.
pub fn decode_batch(kind: RecordKind, body: serde_json::Value) -> Result<Vec<Record>, RecordError> {
    match body {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| Record::decode(kind, item))
            .collect(),
        serde_json::Value::Object(_) => Ok(vec![Record::decode(kind, body)?]),
        other => Err(RecordError::Decode {
            kind,
            reason: format!("expected array or object, got {}", json_type_name(&other)),
        }),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
