use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use cluster_actuator::actuator::{
    Capability, ClusterActuator, RecordQuery, SecurityContext, ServiceRef,
};
use cluster_actuator::aggregate::{AggregateError, Aggregation, Aggregator};
use cluster_actuator::config::AggregationConfig;
use cluster_actuator::discovery::{
    ControlPlane, DiscoveryError, Endpoint, EndpointDirectory, LookupError,
};
use cluster_actuator::expr::{Direction, ExprError, Filter};
use cluster_actuator::fetch::{FetchError, FetchRequest, Fetcher};
use cluster_actuator::record::node::{NodeDescriptor, NodeStatus};
use cluster_actuator::record::{decode_batch, Record, RecordKind};

/// Control plane returning a fixed answer and counting lookups.
struct CountingControlPlane {
    answer: Result<Vec<Endpoint>, LookupError>,
    lookups: AtomicUsize,
}

impl ControlPlane for CountingControlPlane {
    async fn lookup_endpoints(
        &self,
        _namespace: &str,
        _service: &str,
    ) -> Result<Vec<Endpoint>, LookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

/// Fetcher serving canned JSON bodies per endpoint and counting calls.
/// Applies the forwarded filter text the way a peer would.
struct CannedFetcher {
    bodies: HashMap<Endpoint, Result<serde_json::Value, FetchError>>,
    calls: AtomicUsize,
}

impl Fetcher for CannedFetcher {
    async fn fetch(
        &self,
        endpoint: &Endpoint,
        request: &FetchRequest,
    ) -> Result<Vec<Record>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = match self.bodies.get(endpoint) {
            Some(Ok(body)) => body.clone(),
            Some(Err(e)) => return Err(e.clone()),
            None => return Err(FetchError::Connection("connection refused".into())),
        };
        let mut records =
            decode_batch(request.kind, body).map_err(|e| FetchError::Decode(e.to_string()))?;
        if let Some(text) = &request.filter {
            let filter = Filter::compile(text, request.kind)
                .map_err(|e| FetchError::Status {
                    status: 400,
                    body: e.to_string(),
                })?;
            records.retain(|record| filter.matches(record));
        }
        Ok(records)
    }
}

struct Harness {
    actuator: ClusterActuator<CountingControlPlane, CannedFetcher>,
    directory: Arc<EndpointDirectory<CountingControlPlane>>,
    fetcher: Arc<CannedFetcher>,
}

impl Harness {
    fn new(
        answer: Result<Vec<Endpoint>, LookupError>,
        bodies: Vec<(Endpoint, Result<serde_json::Value, FetchError>)>,
    ) -> Self {
        let fetcher = Arc::new(CannedFetcher {
            bodies: bodies.into_iter().collect(),
            calls: AtomicUsize::new(0),
        });
        let directory = Arc::new(EndpointDirectory::new(
            CountingControlPlane {
                answer,
                lookups: AtomicUsize::new(0),
            },
            Duration::ZERO,
        ));
        let actuator = ClusterActuator::new(
            Arc::clone(&directory),
            Aggregator::new(Arc::clone(&fetcher)),
            NodeDescriptor {
                node_id: "n1".to_string(),
                endpoint: Endpoint::new("10.0.0.1", 8080),
                status: NodeStatus::Up,
                metadata: BTreeMap::new(),
            },
            ServiceRef {
                namespace: "prod".to_string(),
                name: "actuator".to_string(),
            },
            AggregationConfig::default(),
        );
        Self {
            actuator,
            directory,
            fetcher,
        }
    }

    fn fetch_calls(&self) -> usize {
        self.fetcher.calls.load(Ordering::SeqCst)
    }

    async fn logs(&self, query: RecordQuery) -> Result<Aggregation, AggregateError> {
        self.actuator
            .aggregate_records(&SecurityContext::trusted("test"), query)
            .await
    }
}

fn ep(n: u8) -> Endpoint {
    Endpoint::new(format!("10.0.0.{n}"), 8080)
}

fn logs(node: &str, ts: &[i64]) -> serde_json::Value {
    serde_json::Value::Array(
        ts.iter()
            .map(|ts| {
                json!({
                    "log": {
                        "ts": ts,
                        "level": "INFO",
                        "logger": "app",
                        "thread": "worker-1",
                        "message": format!("{node} at {ts}"),
                        "node": node,
                    }
                })
            })
            .collect(),
    )
}

fn log_query(direction: Direction, limit: usize) -> RecordQuery {
    RecordQuery {
        kind: "log".to_string(),
        sort_field: Some("log.ts".to_string()),
        direction,
        limit: Some(limit),
        ..Default::default()
    }
}

fn timestamps(aggregation: &Aggregation) -> Vec<i64> {
    aggregation
        .results
        .iter()
        .filter_map(|r| r.raw()["log"]["ts"].as_i64())
        .collect()
}

#[tokio::test]
async fn test_three_peers_merge_ascending() {
    let h = Harness::new(
        Ok(vec![ep(2), ep(3), ep(4)]),
        vec![
            (ep(2), Ok(logs("a", &[10, 12]))),
            (ep(3), Ok(logs("b", &[11]))),
            (ep(4), Ok(logs("c", &[]))),
        ],
    );

    let result = h
        .logs(log_query(Direction::Asc, 5))
        .await
        .expect("all peers answered");

    assert_eq!(timestamps(&result), [10, 11, 12]);
    assert!(result.partial_failures.is_empty());
    assert_eq!(h.fetch_calls(), 3);
}

#[tokio::test]
async fn test_result_length_is_min_of_limit_and_total() {
    let h = Harness::new(
        Ok(vec![ep(2), ep(3)]),
        vec![
            (ep(2), Ok(logs("a", &[5, 1, 3]))),
            (ep(3), Ok(logs("b", &[4, 2]))),
        ],
    );

    let all = h.logs(log_query(Direction::Desc, 50)).await.expect("merged");
    assert_eq!(timestamps(&all), [5, 4, 3, 2, 1]);

    let bounded = h.logs(log_query(Direction::Desc, 2)).await.expect("merged");
    assert_eq!(timestamps(&bounded), [5, 4]);
}

#[tokio::test]
async fn test_exactly_one_failure_is_partial() {
    let h = Harness::new(
        Ok(vec![ep(2), ep(3), ep(4)]),
        vec![
            (ep(2), Ok(logs("a", &[1, 4]))),
            (ep(4), Ok(logs("c", &[2]))),
        ],
    );

    let result = h
        .logs(log_query(Direction::Asc, 10))
        .await
        .expect("one failure does not fail the call");

    assert_eq!(timestamps(&result), [1, 2, 4]);
    assert_eq!(result.partial_failures.len(), 1);
    assert_eq!(result.partial_failures[0].endpoint, ep(3));
    assert!(matches!(
        result.partial_failures[0].error,
        FetchError::Connection(_)
    ));
}

#[tokio::test]
async fn test_every_peer_failing_is_aggregation_failed() {
    let h = Harness::new(
        Ok(vec![ep(2), ep(3)]),
        vec![
            (
                ep(2),
                Err(FetchError::Status {
                    status: 500,
                    body: "boom".into(),
                }),
            ),
            (ep(3), Ok(json!({"unexpected": true}))),
        ],
    );

    let err = h
        .logs(log_query(Direction::Asc, 10))
        .await
        .expect_err("no peer answered");

    let partial_failures = match err {
        AggregateError::AggregationFailed { partial_failures } => partial_failures,
        other => panic!("expected AggregationFailed, got {other}"),
    };
    let endpoints: Vec<Endpoint> = partial_failures.iter().map(|f| f.endpoint.clone()).collect();
    assert_eq!(endpoints, [ep(2), ep(3)]);
    assert!(matches!(partial_failures[1].error, FetchError::Decode(_)));
}

#[tokio::test]
async fn test_unknown_field_issues_no_network_calls() {
    let h = Harness::new(
        Ok(vec![ep(2)]),
        vec![(ep(2), Ok(logs("a", &[1])))],
    );

    let err = h
        .logs(RecordQuery {
            kind: "log".to_string(),
            sort_field: Some("log.nonexistent".to_string()),
            ..Default::default()
        })
        .await
        .expect_err("field is not declared");

    assert!(matches!(
        err,
        AggregateError::Expr(ExprError::UnknownField { .. })
    ));
    assert_eq!(h.fetch_calls(), 0);
    assert_eq!(
        h.directory
            .control_plane()
            .lookups
            .load(Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn test_unorderable_field_is_rejected() {
    let h = Harness::new(Ok(vec![ep(2)]), vec![]);

    let err = h
        .logs(RecordQuery {
            kind: "log".to_string(),
            sort_field: Some("log.mdc".to_string()),
            ..Default::default()
        })
        .await
        .expect_err("maps have no total order");

    assert!(matches!(
        err,
        AggregateError::Expr(ExprError::UnsupportedFieldType { .. })
    ));
    assert_eq!(h.fetch_calls(), 0);
}

#[tokio::test]
async fn test_repeated_queries_return_identical_order() {
    let h = Harness::new(
        Ok(vec![ep(2), ep(3), ep(4)]),
        vec![
            (ep(2), Ok(logs("a", &[7, 7, 3]))),
            (ep(3), Ok(logs("b", &[7, 3]))),
            (ep(4), Ok(logs("c", &[3, 7]))),
        ],
    );

    let first = h.logs(log_query(Direction::Asc, 5)).await.expect("merged");
    let messages = |a: &Aggregation| -> Vec<String> {
        a.results
            .iter()
            .filter_map(|r| r.raw()["log"]["node"].as_str().map(str::to_string))
            .collect()
    };
    assert_eq!(messages(&first), ["a", "b", "c", "a", "b"]);

    for _ in 0..5 {
        let again = h.logs(log_query(Direction::Asc, 5)).await.expect("merged");
        assert_eq!(again.results, first.results);
    }
}

#[tokio::test]
async fn test_zero_endpoints_is_service_not_found() {
    let h = Harness::new(Ok(Vec::new()), vec![]);

    let err = h
        .logs(log_query(Direction::Asc, 5))
        .await
        .expect_err("service has no endpoints");

    assert!(matches!(
        err,
        AggregateError::Discovery(DiscoveryError::ServiceNotFound { .. })
    ));
    assert_eq!(h.fetch_calls(), 0);
}

#[tokio::test]
async fn test_unreachable_control_plane_is_discovery_unavailable() {
    let h = Harness::new(Err(LookupError::Unreachable("connection refused".into())), vec![]);

    let err = h
        .logs(log_query(Direction::Asc, 5))
        .await
        .expect_err("control plane is down and nothing is cached");

    assert!(matches!(
        err,
        AggregateError::Discovery(DiscoveryError::DiscoveryUnavailable { .. })
    ));
}

#[tokio::test]
async fn test_cluster_info_with_no_peers_contains_only_local_node() {
    let h = Harness::new(Ok(Vec::new()), vec![]);

    let result = h
        .actuator
        .aggregate_cluster_info(&SecurityContext::trusted("test"))
        .await
        .expect("local node always answers");

    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0].kind(), RecordKind::NodeInfo);
    assert_eq!(result.results[0].raw()["node"]["id"], json!("n1"));
    assert!(result.partial_failures.is_empty());
}

#[tokio::test]
async fn test_cluster_info_merges_peers_by_node_id() {
    let node = |id: &str, host: &str| {
        json!({
            "node": {
                "id": id,
                "host": host,
                "port": 8080,
                "status": "UP",
                "version": "1.4.2",
            }
        })
    };
    let h = Harness::new(
        Ok(vec![ep(2), ep(3), ep(4)]),
        vec![
            (ep(2), Ok(node("n3", "10.0.0.2"))),
            (ep(3), Ok(node("n0", "10.0.0.3"))),
        ],
    );

    let result = h
        .actuator
        .aggregate_cluster_info(&SecurityContext::trusted("test"))
        .await
        .expect("local node always answers");

    let ids: Vec<&str> = result
        .results
        .iter()
        .filter_map(|r| r.raw()["node"]["id"].as_str())
        .collect();
    assert_eq!(ids, ["n0", "n1", "n3"]);
    assert_eq!(result.partial_failures.len(), 1);
    assert_eq!(result.partial_failures[0].endpoint, ep(4));
}

#[tokio::test]
async fn test_missing_capability_is_forbidden() {
    let h = Harness::new(Ok(vec![ep(2)]), vec![(ep(2), Ok(logs("a", &[1])))]);
    let ctx = SecurityContext::new("dashboard", [Capability::ReadClusterInfo]);

    let err = h
        .actuator
        .aggregate_records(&ctx, log_query(Direction::Asc, 5))
        .await
        .expect_err("dashboard may not read logs");

    assert!(matches!(err, AggregateError::Forbidden { .. }));
    assert!(err.to_string().contains("read_logs"));
    assert_eq!(h.fetch_calls(), 0);

    h.actuator
        .aggregate_cluster_info(&ctx)
        .await
        .expect("cluster info is allowed");
}

#[tokio::test]
async fn test_filter_limits_records_from_every_peer() {
    let leveled = |level: &str, ts: i64| {
        json!({
            "log": {
                "ts": ts,
                "level": level,
                "logger": "app",
                "thread": "main",
                "message": "m",
                "node": "x",
            }
        })
    };
    let h = Harness::new(
        Ok(vec![ep(2), ep(3)]),
        vec![
            (ep(2), Ok(json!([leveled("ERROR", 3), leveled("DEBUG", 1)]))),
            (ep(3), Ok(json!([leveled("warn", 2), leveled("INFO", 4)]))),
        ],
    );

    let result = h
        .logs(RecordQuery {
            kind: "log".to_string(),
            filter: Some("log.level >= WARN".to_string()),
            ..Default::default()
        })
        .await
        .expect("merged");

    assert_eq!(timestamps(&result), [2, 3]);
}

#[tokio::test]
async fn test_cluster_info_keeps_peers_with_lenient_wire_forms() {
    let h = Harness::new(
        Ok(vec![ep(2), ep(3), ep(4)]),
        vec![
            (
                ep(2),
                Ok(json!({"node": {"id": "n2", "host": "h2", "port": 8080, "status": "Up"}})),
            ),
            (
                ep(3),
                Ok(json!({"node": {"id": "n3", "host": "h3", "port": "8080", "status": "down"}})),
            ),
            (
                ep(4),
                Ok(json!({"node": {"id": "n4", "host": "h4", "port": 8080, "status": "UP",
                                    "metadata": {"cores": 8}}})),
            ),
        ],
    );

    let result = h
        .actuator
        .aggregate_cluster_info(&SecurityContext::trusted("test"))
        .await
        .expect("local node always answers");

    assert!(result.partial_failures.is_empty(), "{:?}", result.partial_failures);
    let nodes: Vec<NodeDescriptor> = result
        .results
        .iter()
        .map(|r| NodeDescriptor::from_record(r).expect("nodeinfo record"))
        .collect();
    let ids: Vec<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
    assert_eq!(ids, ["n1", "n2", "n3", "n4"]);
    assert_eq!(nodes[2].status, NodeStatus::Down);
    assert_eq!(nodes[2].endpoint.port, 8080);
    assert_eq!(nodes[3].metadata.get("cores").map(String::as_str), Some("8"));
}

#[tokio::test]
async fn test_forwarded_filter_keeps_quotes_and_backslashes() {
    let failing = |ts: i64, exception: &str| {
        json!({
            "log": {
                "ts": ts,
                "level": "ERROR",
                "logger": "app",
                "thread": "main",
                "message": "m",
                "node": "x",
                "exception": exception,
            }
        })
    };
    let h = Harness::new(
        Ok(vec![ep(2), ep(3)]),
        vec![
            (ep(2), Ok(json!([failing(1, "a\"b"), failing(2, "ab")]))),
            (ep(3), Ok(json!([failing(3, "C:\\tmp"), failing(4, "C:tmp")]))),
        ],
    );

    let query = |filter: &str| RecordQuery {
        kind: "log".to_string(),
        filter: Some(filter.to_string()),
        ..Default::default()
    };

    let quoted = h
        .logs(query("log.exception = 'a\"b'"))
        .await
        .expect("merged");
    assert_eq!(timestamps(&quoted), [1]);
    assert!(quoted.partial_failures.is_empty());

    let backslash = h
        .logs(query("log.exception = 'C:\\tmp'"))
        .await
        .expect("merged");
    assert_eq!(timestamps(&backslash), [3]);
}
