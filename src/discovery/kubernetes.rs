use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{ControlPlane, Endpoint, LookupError};
use crate::config::DiscoveryConfig;

/// Control plane backed by the Kubernetes core `Endpoints` API.
pub struct KubernetesControlPlane {
    http: reqwest::Client,
    api_server: String,
    token: Option<String>,
    port_name: Option<String>,
}

impl KubernetesControlPlane {
    /// Create a client from discovery configuration.
    pub fn new(cfg: &DiscoveryConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building control plane HTTP client")?;

        Ok(Self {
            http,
            api_server: cfg.api_server.trim_end_matches('/').to_string(),
            token: cfg.token.clone().filter(|t| !t.is_empty()),
            port_name: cfg.port_name.clone().filter(|p| !p.is_empty()),
        })
    }

    fn url(&self, namespace: &str, service: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{namespace}/endpoints/{service}",
            self.api_server
        )
    }
}

// --- JSON response structures ---

#[derive(Debug, Deserialize)]
struct EndpointsResponse {
    #[serde(default)]
    subsets: Vec<Subset>,
}

#[derive(Debug, Deserialize)]
struct Subset {
    #[serde(default)]
    addresses: Vec<Address>,
    #[serde(default)]
    ports: Vec<Port>,
}

#[derive(Debug, Deserialize)]
struct Address {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct Port {
    #[serde(default)]
    name: Option<String>,
    port: u16,
}

/// Flattens ready addresses into endpoints, picking the port named
/// `port_name` (or the first port) of each subset.
fn endpoints_from_response(resp: &EndpointsResponse, port_name: Option<&str>) -> Vec<Endpoint> {
    let mut endpoints = Vec::new();

    for subset in &resp.subsets {
        let port = match port_name {
            Some(name) => subset
                .ports
                .iter()
                .find(|p| p.name.as_deref() == Some(name)),
            None => subset.ports.first(),
        };

        let Some(port) = port else {
            continue;
        };

        endpoints.extend(
            subset
                .addresses
                .iter()
                .map(|addr| Endpoint::new(addr.ip.clone(), port.port)),
        );
    }

    endpoints
}

impl ControlPlane for KubernetesControlPlane {
    async fn lookup_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<Endpoint>, LookupError> {
        let url = self.url(namespace, service);
        debug!(%url, "looking up service endpoints");

        let mut request = self.http.get(&url).header("Accept", "application/json");
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LookupError::Unreachable(format!("requesting {url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(LookupError::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LookupError::Unreachable(format!(
                "unexpected status {status} from {url}: {body}"
            )));
        }

        let body: EndpointsResponse = response
            .json()
            .await
            .map_err(|e| LookupError::Malformed(format!("decoding response from {url}: {e}")))?;

        Ok(endpoints_from_response(&body, self.port_name.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "kind": "Endpoints",
        "metadata": {"name": "actuator", "namespace": "prod"},
        "subsets": [
            {
                "addresses": [{"ip": "10.0.0.1"}, {"ip": "10.0.0.2", "hostname": "b"}],
                "notReadyAddresses": [{"ip": "10.0.0.9"}],
                "ports": [{"name": "grpc", "port": 9000}, {"name": "http", "port": 8080}]
            },
            {
                "addresses": [{"ip": "10.0.1.1"}],
                "ports": [{"name": "http", "port": 8081}]
            }
        ]
    }"#;

    fn sample() -> EndpointsResponse {
        serde_json::from_str(SAMPLE).expect("valid sample")
    }

    #[test]
    fn test_named_port_selection() {
        let endpoints = endpoints_from_response(&sample(), Some("http"));
        assert_eq!(
            endpoints,
            vec![
                Endpoint::new("10.0.0.1", 8080),
                Endpoint::new("10.0.0.2", 8080),
                Endpoint::new("10.0.1.1", 8081),
            ]
        );
    }

    #[test]
    fn test_first_port_when_unnamed() {
        let endpoints = endpoints_from_response(&sample(), None);
        assert_eq!(endpoints.first(), Some(&Endpoint::new("10.0.0.1", 9000)));
        assert_eq!(endpoints.len(), 3);
    }

    #[test]
    fn test_subset_without_matching_port_is_skipped() {
        let endpoints = endpoints_from_response(&sample(), Some("grpc"));
        assert_eq!(endpoints.len(), 2);
    }

    #[test]
    fn test_no_subsets() {
        let resp: EndpointsResponse =
            serde_json::from_str(r#"{"kind": "Endpoints"}"#).expect("valid");
        assert!(endpoints_from_response(&resp, None).is_empty());
    }

    #[test]
    fn test_url_trims_trailing_slash() {
        let cfg = DiscoveryConfig {
            api_server: "https://kubernetes.default.svc/".to_string(),
            ..Default::default()
        };
        let cp = KubernetesControlPlane::new(&cfg).expect("client builds");
        assert_eq!(
            cp.url("prod", "actuator"),
            "https://kubernetes.default.svc/api/v1/namespaces/prod/endpoints/actuator"
        );
    }
}
