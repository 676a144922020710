pub mod merge;

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::discovery::{DiscoveryError, Endpoint};
use crate::export::health::ActuatorMetrics;
use crate::expr::{ExprError, Filter, SortOrder};
use crate::fetch::{FetchError, FetchRequest, Fetcher};
use crate::record::{Record, RecordError};

/// Bounds of one aggregation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationWindow {
    /// Deadline for each sub-request and for the fan-out as a whole.
    pub deadline: Duration,
    /// Maximum number of merged records returned.
    pub limit: usize,
}

/// A peer that did not contribute to the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialFailure {
    pub endpoint: Endpoint,
    #[serde(serialize_with = "serialize_display")]
    pub error: FetchError,
}

/// Merged, bounded result of one aggregation call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Aggregation {
    pub results: Vec<Record>,
    pub partial_failures: Vec<PartialFailure>,
}

/// Errors that fail an aggregation call as a whole.
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("aggregation failed: all {} endpoints failed", .partial_failures.len())]
    AggregationFailed { partial_failures: Vec<PartialFailure> },

    #[error("forbidden: {principal:?} lacks capability {capability}")]
    Forbidden {
        principal: String,
        capability: &'static str,
    },
}

/// Everything needed to run one record query across peers.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub request: FetchRequest,
    pub order: SortOrder,
    /// Re-applied to every peer batch after the peer's own filtering.
    pub filter: Option<Filter>,
}

impl QueryPlan {
    /// Checks that the order and filter were compiled for the requested kind.
    pub fn validate(&self) -> Result<(), ExprError> {
        self.order.expr().check_kind(self.request.kind)?;
        if let Some(ref filter) = self.filter {
            filter.expr().check_kind(self.request.kind)?;
        }
        Ok(())
    }
}

/// Outcome of one sub-request, aligned with the endpoint it was sent to.
pub(crate) type FetchOutcome = Result<Vec<Record>, FetchError>;

/// Fans queries out to peers and merges what comes back.
pub struct Aggregator<F> {
    fetcher: Arc<F>,
    metrics: Option<Arc<ActuatorMetrics>>,
}

impl<F: Fetcher + 'static> Aggregator<F> {
    pub fn new(fetcher: Arc<F>) -> Self {
        Self {
            fetcher,
            metrics: None,
        }
    }

    /// Record fan-out outcomes in the given metrics.
    pub fn with_metrics(mut self, metrics: Arc<ActuatorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Queries every endpoint concurrently and merges the batches.
    ///
    /// Peer failures are reported in `partial_failures`. The call fails only
    /// when there was at least one endpoint and none of them answered. An
    /// empty endpoint set yields an empty result without any I/O.
    pub async fn aggregate(
        &self,
        endpoints: &[Endpoint],
        plan: &QueryPlan,
        window: AggregationWindow,
    ) -> Result<Aggregation, AggregateError> {
        plan.validate()?;

        if endpoints.is_empty() {
            return Ok(Aggregation::default());
        }

        let kind = plan.request.kind;
        let started = Instant::now();
        let outcomes = self
            .fan_out(endpoints, &plan.request, window.deadline)
            .await;

        let mut batches = Vec::with_capacity(endpoints.len());
        let mut partial_failures = Vec::new();

        for (endpoint, outcome) in endpoints.iter().zip(outcomes) {
            match outcome.and_then(|records| conforming_batch(records, plan)) {
                Ok(records) => batches.push(records),
                Err(error) => {
                    warn!(%endpoint, %error, kind = %kind, "peer sub-request failed");
                    partial_failures.push(PartialFailure {
                        endpoint: endpoint.clone(),
                        error,
                    });
                    batches.push(Vec::new());
                }
            }
        }

        if partial_failures.len() == endpoints.len() {
            self.record_aggregation(kind.tag(), "failed", started, &partial_failures);
            return Err(AggregateError::AggregationFailed { partial_failures });
        }

        let results = merge::merge(batches, &plan.order, window.limit);

        debug!(
            kind = %kind,
            endpoints = endpoints.len(),
            failed = partial_failures.len(),
            returned = results.len(),
            "aggregation complete",
        );

        let outcome = if partial_failures.is_empty() {
            "success"
        } else {
            "partial"
        };
        self.record_aggregation(kind.tag(), outcome, started, &partial_failures);

        Ok(Aggregation {
            results,
            partial_failures,
        })
    }

    /// Issues one sub-request per endpoint and waits for all of them or the
    /// deadline, whichever comes first.
    ///
    /// Returns one outcome per endpoint, in endpoint order. Sub-requests
    /// still running at the deadline are aborted without waiting and
    /// reported as timeouts.
    pub(crate) async fn fan_out(
        &self,
        endpoints: &[Endpoint],
        request: &FetchRequest,
        deadline: Duration,
    ) -> Vec<FetchOutcome> {
        let kind = request.kind.tag();
        let mut slots: Vec<Option<FetchOutcome>> = endpoints.iter().map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (idx, endpoint) in endpoints.iter().enumerate() {
            let fetcher = Arc::clone(&self.fetcher);
            let endpoint = endpoint.clone();
            let request = request.clone();

            tasks.spawn(async move {
                let start = Instant::now();
                let outcome =
                    match tokio::time::timeout(deadline, fetcher.fetch(&endpoint, &request)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(FetchError::Timeout(deadline)),
                    };
                (idx, outcome, start.elapsed())
            });
        }

        let cutoff = Instant::now() + deadline;
        let mut expired = false;

        loop {
            match tokio::time::timeout_at(cutoff, tasks.join_next()).await {
                Ok(Some(Ok((idx, outcome, elapsed)))) => {
                    self.record_fetch(kind, &outcome, elapsed);
                    if let Some(slot) = slots.get_mut(idx) {
                        *slot = Some(outcome);
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "peer sub-request task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        pending = tasks.len(),
                        ?deadline,
                        "aggregation deadline elapsed, abandoning pending sub-requests",
                    );
                    expired = true;
                    break;
                }
            }
        }

        // Dropping the set aborts whatever is still in flight.
        drop(tasks);

        slots
            .into_iter()
            .map(|slot| match slot {
                Some(outcome) => outcome,
                None if expired => Err(FetchError::Timeout(deadline)),
                None => Err(FetchError::Aborted("task panicked or was cancelled".into())),
            })
            .collect()
    }

    fn record_fetch(&self, kind: &str, outcome: &FetchOutcome, elapsed: Duration) {
        if let Some(ref metrics) = self.metrics {
            let label = match outcome {
                Ok(_) => "success",
                Err(e) => e.label(),
            };
            metrics.fetch_requests.with_label_values(&[kind, label]).inc();
            metrics
                .fetch_duration
                .with_label_values(&[kind])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub(crate) fn record_aggregation(
        &self,
        kind: &str,
        outcome: &str,
        started: Instant,
        failures: &[PartialFailure],
    ) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .aggregations
                .with_label_values(&[kind, outcome])
                .inc();
            metrics
                .aggregation_duration
                .with_label_values(&[kind])
                .observe(started.elapsed().as_secs_f64());
            for failure in failures {
                metrics
                    .partial_failures
                    .with_label_values(&[kind, failure.error.label()])
                    .inc();
            }
        }
    }
}

/// Rejects batches containing records of another kind, then applies the
/// plan's filter.
fn conforming_batch(records: Vec<Record>, plan: &QueryPlan) -> Result<Vec<Record>, FetchError> {
    if let Some(stray) = records.iter().find(|r| r.kind() != plan.request.kind) {
        return Err(FetchError::Decode(format!(
            "peer returned a {} record for a {} query",
            stray.kind(),
            plan.request.kind
        )));
    }

    Ok(match plan.filter {
        Some(ref filter) => records.into_iter().filter(|r| filter.matches(r)).collect(),
        None => records,
    })
}

fn serialize_display<T: std::fmt::Display, S: Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
