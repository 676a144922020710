pub mod kubernetes;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::export::health::ActuatorMetrics;

/// Network address of one peer's actuator surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses `host:port` or `[v6addr]:port`.
impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .with_context(|| format!("endpoint {s:?} is missing a port"))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            bail!("endpoint {s:?} is missing a host");
        }

        let port = port
            .parse::<u16>()
            .with_context(|| format!("parsing port of endpoint {s:?}"))?;

        Ok(Self::new(host, port))
    }
}

/// Directory-level failures, fatal to the call that triggered them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("discovery unavailable for {namespace}/{service}: {reason}")]
    DiscoveryUnavailable {
        namespace: String,
        service: String,
        reason: String,
    },

    #[error("service {namespace}/{service} has no registered endpoints")]
    ServiceNotFound { namespace: String, service: String },
}

/// Failure reported by a control-plane lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("control plane unreachable: {0}")]
    Unreachable(String),

    #[error("service not registered with the control plane")]
    NotFound,

    #[error("malformed control plane response: {0}")]
    Malformed(String),
}

/// Control-plane membership lookup.
pub trait ControlPlane: Send + Sync {
    /// Lists the endpoints currently registered for `service` in `namespace`.
    fn lookup_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> impl Future<Output = Result<Vec<Endpoint>, LookupError>> + Send;
}

/// Fixed endpoint list, for single-host setups and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticControlPlane {
    endpoints: Vec<Endpoint>,
}

impl StaticControlPlane {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}

impl ControlPlane for StaticControlPlane {
    async fn lookup_endpoints(
        &self,
        _namespace: &str,
        _service: &str,
    ) -> Result<Vec<Endpoint>, LookupError> {
        Ok(self.endpoints.clone())
    }
}

/// Whether a resolution may be answered from the cached snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Serve a snapshot younger than the cache TTL, and fall back to the last
    /// snapshot when the control plane is unreachable.
    #[default]
    AllowCached,
    /// Always consult the control plane; never serve a snapshot.
    RequireFresh,
}

#[derive(Debug, Clone)]
struct Snapshot {
    endpoints: Arc<[Endpoint]>,
    resolved_at: Instant,
}

type ServiceKey = (String, String);

/// Resolves services to their current endpoint set.
///
/// The directory is the only writer of endpoint snapshots. It never retries;
/// failures surface to the caller immediately.
pub struct EndpointDirectory<C> {
    control_plane: C,
    cache_ttl: Duration,
    cache: parking_lot::Mutex<HashMap<ServiceKey, Snapshot>>,
    metrics: Option<Arc<ActuatorMetrics>>,
}

impl<C: ControlPlane> EndpointDirectory<C> {
    /// Creates a directory. A zero `cache_ttl` re-resolves on every call and
    /// keeps the last snapshot only as an outage fallback.
    pub fn new(control_plane: C, cache_ttl: Duration) -> Self {
        Self {
            control_plane,
            cache_ttl,
            cache: parking_lot::Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    /// Record discovery outcomes in the given metrics.
    pub fn with_metrics(mut self, metrics: Arc<ActuatorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn control_plane(&self) -> &C {
        &self.control_plane
    }

    /// Resolves `namespace/service` to an ordered, deduplicated endpoint set.
    pub async fn resolve(
        &self,
        namespace: &str,
        service: &str,
        freshness: Freshness,
    ) -> Result<Arc<[Endpoint]>, DiscoveryError> {
        let key = (namespace.to_string(), service.to_string());

        if freshness == Freshness::AllowCached {
            if let Some(endpoints) = self.cached(&key, Some(self.cache_ttl)) {
                debug!(namespace, service, count = endpoints.len(), "serving cached endpoints");
                self.record("cache_hit");
                return Ok(endpoints);
            }
        }

        match self.control_plane.lookup_endpoints(namespace, service).await {
            Ok(found) => {
                let endpoints = dedupe(found);

                if endpoints.is_empty() {
                    self.cache.lock().remove(&key);
                    self.record("not_found");
                    return Err(DiscoveryError::ServiceNotFound {
                        namespace: key.0,
                        service: key.1,
                    });
                }

                let endpoints: Arc<[Endpoint]> = endpoints.into();
                debug!(namespace, service, count = endpoints.len(), "resolved endpoints");

                self.cache.lock().insert(
                    key,
                    Snapshot {
                        endpoints: Arc::clone(&endpoints),
                        resolved_at: Instant::now(),
                    },
                );
                self.record("success");
                if let Some(ref metrics) = self.metrics {
                    metrics.endpoints_discovered.set(endpoints.len() as f64);
                }

                Ok(endpoints)
            }
            Err(LookupError::NotFound) => {
                self.cache.lock().remove(&key);
                self.record("not_found");
                Err(DiscoveryError::ServiceNotFound {
                    namespace: key.0,
                    service: key.1,
                })
            }
            Err(e) => {
                if freshness == Freshness::AllowCached {
                    if let Some(endpoints) = self.cached(&key, None) {
                        warn!(
                            namespace,
                            service,
                            error = %e,
                            count = endpoints.len(),
                            "control plane lookup failed, serving last known endpoints",
                        );
                        self.record("stale");
                        return Ok(endpoints);
                    }
                }

                self.record("unavailable");
                Err(DiscoveryError::DiscoveryUnavailable {
                    namespace: key.0,
                    service: key.1,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Returns the snapshot for `key` if it is younger than `max_age`
    /// (any age when `max_age` is `None`).
    fn cached(&self, key: &ServiceKey, max_age: Option<Duration>) -> Option<Arc<[Endpoint]>> {
        let cache = self.cache.lock();
        let snapshot = cache.get(key)?;

        match max_age {
            Some(ttl) if snapshot.resolved_at.elapsed() >= ttl => None,
            _ => Some(Arc::clone(&snapshot.endpoints)),
        }
    }

    fn record(&self, outcome: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .discovery_requests
                .with_label_values(&[outcome])
                .inc();
        }
    }
}

/// Drops repeated endpoints, keeping first-seen order.
fn dedupe(endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
    let mut seen = HashSet::with_capacity(endpoints.len());
    endpoints
        .into_iter()
        .filter(|ep| seen.insert(ep.clone()))
        .collect()
}
