pub mod http;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::discovery::Endpoint;
use crate::record::{Record, RecordKind};

/// What to ask each peer for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub kind: RecordKind,
    /// Canonical filter expression applied by the peer before returning.
    pub filter: Option<String>,
    pub limit: usize,
}

/// Per-endpoint failure. Recorded as a partial failure, never escalated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decoding response: {0}")]
    Decode(String),

    #[error("sub-request aborted: {0}")]
    Aborted(String),
}

impl FetchError {
    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Connection(_) => "connection",
            Self::Status { .. } => "status",
            Self::Decode(_) => "decode",
            Self::Aborted(_) => "aborted",
        }
    }
}

/// Fetches records from one peer's local (non-cluster) resource.
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        endpoint: &Endpoint,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<Vec<Record>, FetchError>> + Send;
}
