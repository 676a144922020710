use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::aggregate::AggregationWindow;
use crate::discovery::Endpoint;
use crate::record::node::{NodeDescriptor, NodeStatus};

/// Top-level configuration for the cluster actuator.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identity of the local node.
    #[serde(default)]
    pub node: NodeConfig,

    /// Peer discovery configuration.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Fan-out bounds and peer request shape.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Identity of the local node, reported in cluster info.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier.
    #[serde(default)]
    pub node_id: String,

    /// Host peers use to reach this node. Default: "127.0.0.1".
    #[serde(default = "default_node_host")]
    pub host: String,

    /// Actuator port of this node. Default: 8080.
    #[serde(default = "default_node_port")]
    pub port: u16,

    /// Free-form labels reported with the node descriptor.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Peer discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Control-plane namespace of the service. Default: "default".
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Service whose endpoints are the cluster peers.
    #[serde(default)]
    pub service_name: String,

    /// Control-plane API base URL (e.g., "https://kubernetes.default.svc").
    #[serde(default)]
    pub api_server: String,

    /// Bearer token for the control-plane API.
    #[serde(default)]
    pub token: Option<String>,

    /// Named port to select from each endpoint subset. Default: first port.
    #[serde(default)]
    pub port_name: Option<String>,

    /// Fixed peer list ("host:port"). Replaces the control-plane lookup when set.
    #[serde(default)]
    pub static_endpoints: Vec<String>,

    /// Control-plane request timeout. Default: 5s.
    #[serde(default = "default_discovery_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// How long a resolution may be reused. Default: 0s (resolve every call).
    #[serde(default, with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Interval of the background membership refresh in `serve`. Default: 30s.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

/// Fan-out bounds and peer request shape.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Deadline for one aggregation call. Default: 5s.
    #[serde(default = "default_deadline", with = "humantime_serde")]
    pub deadline: Duration,

    /// Result limit when a query does not set one. Default: 100.
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Upper bound applied to every query limit. Default: 10000.
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    /// URL scheme for peer requests. Default: "http".
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Path prefix of the per-node actuator resources. Default: "/actuator".
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_node_host() -> String {
    "127.0.0.1".to_string()
}

fn default_node_port() -> u16 {
    8080
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_discovery_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_deadline() -> Duration {
    Duration::from_secs(5)
}

fn default_limit() -> usize {
    100
}

fn default_max_limit() -> usize {
    10_000
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_base_path() -> String {
    "/actuator".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node: NodeConfig::default(),
            discovery: DiscoveryConfig::default(),
            aggregation: AggregationConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            host: default_node_host(),
            port: default_node_port(),
            metadata: BTreeMap::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            service_name: String::new(),
            api_server: String::new(),
            token: None,
            port_name: None,
            static_endpoints: Vec::new(),
            timeout: default_discovery_timeout(),
            cache_ttl: Duration::ZERO,
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            deadline: default_deadline(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            scheme: default_scheme(),
            base_path: default_base_path(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.is_empty() {
            bail!("node.node_id is required");
        }

        if self.node.port == 0 {
            bail!("node.port must be positive");
        }

        if self.discovery.service_name.is_empty() {
            bail!("discovery.service_name is required");
        }

        if self.discovery.static_endpoints.is_empty() {
            if self.discovery.api_server.is_empty() {
                bail!("discovery.api_server is required when discovery.static_endpoints is empty");
            }
        } else {
            self.discovery
                .parsed_static_endpoints()
                .context("invalid discovery.static_endpoints")?;
        }

        if self.discovery.refresh_interval.is_zero() {
            bail!("discovery.refresh_interval must be positive");
        }

        if self.aggregation.deadline.is_zero() {
            bail!("aggregation.deadline must be positive");
        }

        if self.aggregation.max_limit == 0 {
            bail!("aggregation.max_limit must be positive");
        }

        if self.aggregation.default_limit == 0 {
            bail!("aggregation.default_limit must be positive");
        }

        if self.aggregation.default_limit > self.aggregation.max_limit {
            bail!(
                "aggregation.default_limit ({}) must not exceed aggregation.max_limit ({})",
                self.aggregation.default_limit,
                self.aggregation.max_limit
            );
        }

        match self.aggregation.scheme.as_str() {
            "http" | "https" => {}
            other => bail!("invalid aggregation.scheme: {other}"),
        }

        if !self.aggregation.base_path.starts_with('/') {
            bail!("aggregation.base_path must start with '/'");
        }

        Ok(())
    }
}

impl NodeConfig {
    /// Descriptor of the local node. The local node always reports itself UP.
    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            node_id: self.node_id.clone(),
            endpoint: Endpoint::new(self.host.clone(), self.port),
            status: NodeStatus::Up,
            metadata: self.metadata.clone(),
        }
    }
}

impl DiscoveryConfig {
    /// Parses `static_endpoints` into endpoints.
    pub fn parsed_static_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.static_endpoints
            .iter()
            .map(|s| s.parse::<Endpoint>())
            .collect()
    }
}

impl AggregationConfig {
    /// Window for one call: `limit` clamped to `max_limit`, absent values
    /// taken from configuration.
    pub fn window(&self, limit: Option<usize>, deadline: Option<Duration>) -> AggregationWindow {
        AggregationWindow {
            deadline: deadline
                .filter(|d| !d.is_zero())
                .unwrap_or(self.deadline),
            limit: limit
                .unwrap_or(self.default_limit)
                .min(self.max_limit),
        }
    }
}
