use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Record, RecordError, RecordKind};
use crate::discovery::Endpoint;
use crate::expr::{compile, Value};

/// Self-reported health of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    #[serde(alias = "up")]
    Up,
    #[serde(alias = "down")]
    Down,
    #[default]
    #[serde(alias = "unknown")]
    Unknown,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Maps a canonical schema name back to a status.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "UP" => Some(Self::Up),
            "DOWN" => Some(Self::Down),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Identity and health of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub endpoint: Endpoint,
    pub status: NodeStatus,
    pub metadata: BTreeMap<String, String>,
}

/// Wire shape of the `node` object.
#[derive(Serialize)]
struct NodeJson<'a> {
    id: &'a str,
    host: &'a str,
    port: u16,
    status: NodeStatus,
    metadata: &'a BTreeMap<String, String>,
}

impl NodeDescriptor {
    /// Builds the nodeinfo record for this descriptor.
    pub fn to_record(&self) -> Result<Record, RecordError> {
        let node = NodeJson {
            id: &self.node_id,
            host: &self.endpoint.host,
            port: self.endpoint.port,
            status: self.status,
            metadata: &self.metadata,
        };
        Record::decode(RecordKind::NodeInfo, json!({ "node": node }))
    }

    /// Reads a descriptor back out of a nodeinfo record.
    ///
    /// Works from the values the record decoder already coerced, so any
    /// schema-valid spelling (lowercase status, string-encoded port) is
    /// accepted. Non-string metadata values are kept in their JSON text form.
    pub fn from_record(record: &Record) -> Result<Self, RecordError> {
        if record.kind() != RecordKind::NodeInfo {
            return Err(RecordError::Decode {
                kind: record.kind(),
                reason: "not a nodeinfo record".to_string(),
            });
        }

        let node_id = match node_field(record, "node.id")? {
            Value::Str(id) => id,
            other => return Err(invalid("node.id", &other)),
        };
        let host = match node_field(record, "node.host")? {
            Value::Str(host) => host,
            other => return Err(invalid("node.host", &other)),
        };
        let port = match node_field(record, "node.port")? {
            Value::Int(port) => {
                u16::try_from(port).map_err(|_| invalid("node.port", &Value::Int(port)))?
            }
            other => return Err(invalid("node.port", &other)),
        };
        let status = match node_field(record, "node.status")? {
            Value::Enum { name, .. } => NodeStatus::from_name(name).unwrap_or_default(),
            other => return Err(invalid("node.status", &other)),
        };

        let metadata = record
            .raw()
            .get("node")
            .and_then(|node| node.get("metadata"))
            .and_then(serde_json::Value::as_object)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, value)| {
                        let text = match value {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (key.clone(), text)
                    })
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();

        Ok(Self {
            node_id,
            endpoint: Endpoint::new(host, port),
            status,
            metadata,
        })
    }
}

/// Decoded value of one nodeinfo field.
fn node_field(record: &Record, path: &str) -> Result<Value, RecordError> {
    let expr = compile(path, RecordKind::NodeInfo).map_err(|e| RecordError::Decode {
        kind: RecordKind::NodeInfo,
        reason: e.to_string(),
    })?;
    Ok(expr.extract(record))
}

fn invalid(path: &str, value: &Value) -> RecordError {
    RecordError::Decode {
        kind: RecordKind::NodeInfo,
        reason: format!("{path} has unusable value {value}"),
    }
}
