use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "cluster_actuator";

/// Listen address used when none is configured.
const DEFAULT_LISTEN: &str = "0.0.0.0:9090";

/// Prometheus metrics for discovery, fan-out and aggregation.
///
/// All metrics use the "cluster_actuator" namespace. Served on `/metrics`
/// next to a `/healthz` liveness check.
pub struct ActuatorMetrics {
    registry: Registry,
    addr: String,
    /// Shutdown token and task of the running server, if started.
    server: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,

    // === Discovery ===
    /// Endpoint resolutions by outcome (success/cache_hit/stale/not_found/unavailable).
    pub discovery_requests: CounterVec,
    /// Number of endpoints returned by the last successful resolution.
    pub endpoints_discovered: Gauge,

    // === Fan-out ===
    /// Peer sub-requests by record kind and outcome.
    pub fetch_requests: CounterVec,
    /// Peer sub-request duration by record kind.
    pub fetch_duration: HistogramVec,

    // === Aggregation ===
    /// Aggregation calls by record kind and outcome (success/partial/failed).
    pub aggregations: CounterVec,
    /// End-to-end aggregation duration by record kind.
    pub aggregation_duration: HistogramVec,
    /// Peers left out of a result, by record kind and error type.
    pub partial_failures: CounterVec,
    /// Calls rejected by the security context, by capability.
    pub forbidden: CounterVec,
}

impl ActuatorMetrics {
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let discovery_requests = CounterVec::new(
            Opts::new(
                "discovery_requests_total",
                "Endpoint directory resolutions by outcome.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let endpoints_discovered = Gauge::with_opts(
            Opts::new(
                "endpoints_discovered",
                "Endpoints returned by the last successful resolution.",
            )
            .namespace(NAMESPACE),
        )?;

        let fetch_requests = CounterVec::new(
            Opts::new(
                "fetch_requests_total",
                "Peer sub-requests by record kind and outcome.",
            )
            .namespace(NAMESPACE),
            &["kind", "outcome"],
        )?;
        let fetch_duration = HistogramVec::new(
            HistogramOpts::new(
                "fetch_duration_seconds",
                "Peer sub-request duration by record kind.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["kind"],
        )?;

        let aggregations = CounterVec::new(
            Opts::new(
                "aggregations_total",
                "Aggregation calls by record kind and outcome.",
            )
            .namespace(NAMESPACE),
            &["kind", "outcome"],
        )?;
        let aggregation_duration = HistogramVec::new(
            HistogramOpts::new(
                "aggregation_duration_seconds",
                "End-to-end aggregation duration by record kind.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["kind"],
        )?;
        let partial_failures = CounterVec::new(
            Opts::new(
                "partial_failures_total",
                "Peers left out of an aggregation result by record kind and error type.",
            )
            .namespace(NAMESPACE),
            &["kind", "error_type"],
        )?;
        let forbidden = CounterVec::new(
            Opts::new(
                "forbidden_total",
                "Calls rejected for a missing capability.",
            )
            .namespace(NAMESPACE),
            &["capability"],
        )?;

        registry.register(Box::new(discovery_requests.clone()))?;
        registry.register(Box::new(endpoints_discovered.clone()))?;
        registry.register(Box::new(fetch_requests.clone()))?;
        registry.register(Box::new(fetch_duration.clone()))?;
        registry.register(Box::new(aggregations.clone()))?;
        registry.register(Box::new(aggregation_duration.clone()))?;
        registry.register(Box::new(partial_failures.clone()))?;
        registry.register(Box::new(forbidden.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            server: parking_lot::Mutex::new(None),
            discovery_requests,
            endpoints_discovered,
            fetch_requests,
            fetch_duration,
            aggregations,
            aggregation_duration,
            partial_failures,
            forbidden,
        })
    }

    /// Renders every registered metric in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving `/metrics` and `/healthz`.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listen = listen_addr(&self.addr);
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("binding health server to {listen}"))?;
        let bound = listener.local_addr().context("reading health server address")?;

        let routes = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(self.registry.clone());

        let token = CancellationToken::new();
        let stopped = token.clone();
        let task = tokio::spawn(async move {
            tracing::info!(addr = %bound, "health server listening");
            let served = axum::serve(listener, routes)
                .with_graceful_shutdown(async move { stopped.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "health server failed");
            }
        });

        if let Some((previous, _)) = self.server.lock().replace((token, task)) {
            previous.cancel();
        }

        Ok(bound)
    }

    /// Stops the server and waits for in-flight scrapes to finish.
    pub async fn stop(&self) -> Result<()> {
        let Some((token, task)) = self.server.lock().take() else {
            return Ok(());
        };
        token.cancel();
        task.await.context("health server task")
    }
}

/// Resolves the configured listen address. A bare `:port` binds every
/// interface.
fn listen_addr(configured: &str) -> String {
    let configured = configured.trim();
    if configured.is_empty() {
        DEFAULT_LISTEN.to_string()
    } else if configured.starts_with(':') {
        format!("0.0.0.0{configured}")
    } else {
        configured.to_string()
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(registry): State<Registry>) -> impl IntoResponse {
    match encode(&registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_namespaced_metrics() {
        let metrics = ActuatorMetrics::new(":0").expect("metrics register");
        metrics
            .aggregations
            .with_label_values(&["log", "success"])
            .inc();
        metrics.endpoints_discovered.set(3.0);

        let text = metrics.render().expect("renders");
        assert!(text.contains("cluster_actuator_aggregations_total"));
        assert!(text.contains("kind=\"log\""));
        assert!(text.contains("cluster_actuator_endpoints_discovered 3"));
    }

    #[test]
    fn test_listen_addr() {
        assert_eq!(listen_addr(""), "0.0.0.0:9090");
        assert_eq!(listen_addr(":9464"), "0.0.0.0:9464");
        assert_eq!(listen_addr("127.0.0.1:0"), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_server_serves_healthz_and_metrics() {
        let metrics = ActuatorMetrics::new("127.0.0.1:0").expect("metrics register");
        metrics
            .discovery_requests
            .with_label_values(&["success"])
            .inc();

        let addr = metrics.start().await.expect("server starts");

        let healthz = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .expect("healthz reachable")
            .text()
            .await
            .expect("healthz body");
        assert_eq!(healthz, "ok");

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .expect("metrics reachable")
            .text()
            .await
            .expect("metrics body");
        assert!(body.contains("cluster_actuator_discovery_requests_total"));

        metrics.stop().await.expect("stops");
        assert!(reqwest::get(format!("http://{addr}/healthz")).await.is_err());
    }
}
