use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::aggregate::{AggregateError, Aggregation, Aggregator, QueryPlan};
use crate::cluster::ClusterInfoAssembler;
use crate::config::AggregationConfig;
use crate::discovery::{ControlPlane, DiscoveryError, Endpoint, EndpointDirectory, Freshness};
use crate::export::ActuatorMetrics;
use crate::expr::{compile, Direction, Filter, SortOrder};
use crate::fetch::{FetchRequest, Fetcher};
use crate::record::node::NodeDescriptor;
use crate::record::RecordKind;

/// Operation a caller may be authorized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    ReadClusterInfo,
    ReadLogs,
    ReadProfiles,
}

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::ReadClusterInfo,
        Capability::ReadLogs,
        Capability::ReadProfiles,
    ];

    /// Capability needed to read records of `kind`.
    pub fn for_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Log => Self::ReadLogs,
            RecordKind::Profile => Self::ReadProfiles,
            RecordKind::NodeInfo => Self::ReadClusterInfo,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadClusterInfo => "read_cluster_info",
            Self::ReadLogs => "read_logs",
            Self::ReadProfiles => "read_profiles",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pre-validated caller identity and its granted capabilities.
///
/// Authentication happens before the actuator is reached; this only carries
/// the outcome.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    principal: String,
    capabilities: BTreeSet<Capability>,
}

impl SecurityContext {
    pub fn new(
        principal: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            principal: principal.into(),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// A context holding every capability, for in-process callers such as the CLI.
    pub fn trusted(principal: impl Into<String>) -> Self {
        Self::new(principal, Capability::ALL)
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Fails with `Forbidden` unless `capability` was granted.
    pub fn require(&self, capability: Capability) -> Result<(), AggregateError> {
        if self.allows(capability) {
            Ok(())
        } else {
            Err(AggregateError::Forbidden {
                principal: self.principal.clone(),
                capability: capability.as_str(),
            })
        }
    }
}

/// A cluster-wide record query as received from a caller.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    /// Record kind tag ("log", "profile", "nodeinfo").
    pub kind: String,
    /// Optional `<path> <op> <literal>` filter.
    pub filter: Option<String>,
    /// Sort field path. Defaults to the kind's timestamp or id field.
    pub sort_field: Option<String>,
    pub direction: Direction,
    pub limit: Option<usize>,
    pub deadline: Option<Duration>,
}

/// Service whose endpoints make up the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

/// Entry point of the aggregation layer.
///
/// Resolves peers once per call, fans the query out and merges the answers.
pub struct ClusterActuator<C, F> {
    directory: Arc<EndpointDirectory<C>>,
    aggregator: Aggregator<F>,
    assembler: ClusterInfoAssembler,
    service: ServiceRef,
    aggregation: AggregationConfig,
    freshness: Freshness,
    metrics: Option<Arc<ActuatorMetrics>>,
}

impl<C, F> ClusterActuator<C, F>
where
    C: ControlPlane,
    F: Fetcher + 'static,
{
    pub fn new(
        directory: Arc<EndpointDirectory<C>>,
        aggregator: Aggregator<F>,
        local: NodeDescriptor,
        service: ServiceRef,
        aggregation: AggregationConfig,
    ) -> Self {
        Self {
            directory,
            aggregator,
            assembler: ClusterInfoAssembler::new(local),
            service,
            aggregation,
            freshness: Freshness::default(),
            metrics: None,
        }
    }

    /// Require a fresh control-plane answer on every call.
    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }

    /// Record rejected calls in the given metrics.
    pub fn with_metrics(mut self, metrics: Arc<ActuatorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn directory(&self) -> &Arc<EndpointDirectory<C>> {
        &self.directory
    }

    /// Node descriptors of every reachable cluster member, local node included.
    ///
    /// A service with no registered endpoints yields the local node alone.
    pub async fn aggregate_cluster_info(
        &self,
        ctx: &SecurityContext,
    ) -> Result<Aggregation, AggregateError> {
        self.authorize(ctx, Capability::ReadClusterInfo)?;

        let window = self.aggregation.window(None, None);
        let endpoints = match self.resolve().await {
            Ok(endpoints) => endpoints,
            Err(DiscoveryError::ServiceNotFound { namespace, service }) => {
                info!(%namespace, %service, "no registered peers, reporting local node only");
                Arc::from(Vec::<Endpoint>::new())
            }
            Err(e) => return Err(e.into()),
        };

        self.assembler
            .assemble(&self.aggregator, &endpoints, window)
            .await
    }

    /// Records of one kind from every peer, merged into a single bounded,
    /// ordered sequence.
    ///
    /// Caller-input errors (unknown kind, unknown or unorderable field,
    /// malformed filter, missing capability) fail before any network I/O.
    pub async fn aggregate_records(
        &self,
        ctx: &SecurityContext,
        query: RecordQuery,
    ) -> Result<Aggregation, AggregateError> {
        let kind = RecordKind::from_tag(&query.kind)?;
        self.authorize(ctx, Capability::for_kind(kind))?;

        let sort_field = query
            .sort_field
            .as_deref()
            .unwrap_or_else(|| kind.default_sort());
        let order = SortOrder::new(compile(sort_field, kind)?, query.direction);
        let filter = query
            .filter
            .as_deref()
            .map(|source| Filter::compile(source, kind))
            .transpose()?;

        let window = self.aggregation.window(query.limit, query.deadline);
        let plan = QueryPlan {
            request: FetchRequest {
                kind,
                filter: filter.as_ref().map(ToString::to_string),
                limit: window.limit,
            },
            order,
            filter,
        };
        plan.validate()?;

        let endpoints = self.resolve().await?;

        debug!(
            kind = %kind,
            sort = sort_field,
            direction = %query.direction,
            limit = window.limit,
            endpoints = endpoints.len(),
            "aggregating records",
        );

        self.aggregator.aggregate(&endpoints, &plan, window).await
    }

    async fn resolve(&self) -> Result<Arc<[Endpoint]>, DiscoveryError> {
        self.directory
            .resolve(&self.service.namespace, &self.service.name, self.freshness)
            .await
    }

    fn authorize(&self, ctx: &SecurityContext, capability: Capability) -> Result<(), AggregateError> {
        let result = ctx.require(capability);
        if result.is_err() {
            warn!(principal = ctx.principal(), %capability, "capability check failed");
            if let Some(ref metrics) = self.metrics {
                metrics
                    .forbidden
                    .with_label_values(&[capability.as_str()])
                    .inc();
            }
        }
        result
    }
}
