use tokio::time::Instant;
use tracing::{debug, warn};

use crate::aggregate::{
    merge, AggregateError, Aggregation, AggregationWindow, Aggregator, PartialFailure,
};
use crate::discovery::Endpoint;
use crate::expr::{compile, CompiledExpression, Direction, SortOrder, Value};
use crate::fetch::{FetchError, FetchRequest, Fetcher};
use crate::record::node::NodeDescriptor;
use crate::record::{Record, RecordKind};

/// Builds the cluster-wide node view: every peer's self-reported descriptor
/// plus the local node's, ordered by node id.
pub struct ClusterInfoAssembler {
    local: NodeDescriptor,
}

impl ClusterInfoAssembler {
    pub fn new(local: NodeDescriptor) -> Self {
        Self { local }
    }

    pub fn local(&self) -> &NodeDescriptor {
        &self.local
    }

    /// Fans a nodeinfo request out to `endpoints` and merges the answers with
    /// the local descriptor.
    ///
    /// The local node always answers, so peer failures only ever show up in
    /// `partial_failures`. A peer reporting the local node id is superseded
    /// by the local descriptor.
    pub async fn assemble<F: Fetcher + 'static>(
        &self,
        aggregator: &Aggregator<F>,
        endpoints: &[Endpoint],
        window: AggregationWindow,
    ) -> Result<Aggregation, AggregateError> {
        let started = Instant::now();
        let order = SortOrder::new(
            compile(RecordKind::NodeInfo.default_sort(), RecordKind::NodeInfo)?,
            Direction::Asc,
        );
        let request = FetchRequest {
            kind: RecordKind::NodeInfo,
            filter: None,
            limit: window.limit,
        };

        let mut batches = Vec::with_capacity(endpoints.len() + 1);
        batches.push(vec![self.local.to_record()?]);

        let mut partial_failures = Vec::new();
        let outcomes = if endpoints.is_empty() {
            Vec::new()
        } else {
            aggregator.fan_out(endpoints, &request, window.deadline).await
        };

        for (endpoint, outcome) in endpoints.iter().zip(outcomes) {
            match outcome.and_then(|records| self.remote_descriptors(order.expr(), records)) {
                Ok(records) => batches.push(records),
                Err(error) => {
                    warn!(%endpoint, %error, "peer did not report node info");
                    partial_failures.push(PartialFailure {
                        endpoint: endpoint.clone(),
                        error,
                    });
                }
            }
        }

        let results = merge::merge(batches, &order, window.limit);

        debug!(
            local = %self.local.node_id,
            peers = endpoints.len(),
            failed = partial_failures.len(),
            nodes = results.len(),
            "cluster info assembled",
        );

        let outcome = if partial_failures.is_empty() {
            "success"
        } else {
            "partial"
        };
        aggregator.record_aggregation(
            RecordKind::NodeInfo.tag(),
            outcome,
            started,
            &partial_failures,
        );

        Ok(Aggregation {
            results,
            partial_failures,
        })
    }

    /// Keeps the nodeinfo records of one peer batch, dropping any that claim
    /// the local node id. Only `node.id` is inspected here.
    fn remote_descriptors(
        &self,
        id: &CompiledExpression,
        records: Vec<Record>,
    ) -> Result<Vec<Record>, FetchError> {
        let local = Value::Str(self.local.node_id.clone());
        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            id.check_kind(record.kind())
                .map_err(|e| FetchError::Decode(e.to_string()))?;
            if id.extract(&record) != local {
                kept.push(record);
            }
        }
        Ok(kept)
    }
}
