use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use super::{FetchError, FetchRequest, Fetcher};
use crate::config::AggregationConfig;
use crate::discovery::Endpoint;
use crate::record::{decode_batch, Record, RecordKind};

/// Maximum number of error body bytes kept in a `FetchError::Status`.
const MAX_ERROR_BODY: usize = 512;

/// HTTP client for peer actuator resources.
///
/// Requests `{scheme}://{host}:{port}{base_path}/{kind}?limit=N[&filter=..]`
/// and decodes the JSON body against the record kind's schema.
pub struct HttpFetcher {
    http: reqwest::Client,
    scheme: String,
    base_path: String,
    timeout: Duration,
}

impl HttpFetcher {
    /// Create a new fetcher. The client timeout matches the aggregation deadline.
    pub fn new(cfg: &AggregationConfig) -> Result<Self> {
        let timeout = if cfg.deadline.is_zero() {
            Duration::from_secs(5)
        } else {
            cfg.deadline
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building peer HTTP client")?;

        Ok(Self {
            http,
            scheme: cfg.scheme.clone(),
            base_path: cfg.base_path.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, endpoint: &Endpoint, kind: RecordKind) -> String {
        format!(
            "{}://{}{}/{}",
            self.scheme,
            endpoint,
            self.base_path,
            kind.tag()
        )
    }

    fn classify(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if e.is_decode() || e.is_body() {
            FetchError::Decode(e.to_string())
        } else {
            FetchError::Connection(e.to_string())
        }
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        endpoint: &Endpoint,
        request: &FetchRequest,
    ) -> Result<Vec<Record>, FetchError> {
        let url = self.url(endpoint, request.kind);

        let mut query = vec![("limit", request.limit.to_string())];
        if let Some(ref filter) = request.filter {
            query.push(("filter", filter.clone()));
        }

        debug!(%url, limit = request.limit, "fetching peer records");

        let response = self
            .http
            .get(&url)
            .query(&query)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate_utf8(&mut body, MAX_ERROR_BODY);
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response.json().await.map_err(|e| self.classify(e))?;

        decode_batch(request.kind, body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

/// Truncates `s` to at most `max` bytes on a char boundary.
fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}
