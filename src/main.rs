use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use cluster_actuator::actuator::{ClusterActuator, RecordQuery, SecurityContext, ServiceRef};
use cluster_actuator::aggregate::{Aggregation, Aggregator};
use cluster_actuator::config::Config;
use cluster_actuator::discovery::kubernetes::KubernetesControlPlane;
use cluster_actuator::discovery::{
    ControlPlane, DiscoveryError, EndpointDirectory, Freshness, StaticControlPlane,
};
use cluster_actuator::export::ActuatorMetrics;
use cluster_actuator::expr::Direction;
use cluster_actuator::fetch::http::HttpFetcher;

/// Cluster-wide aggregation of actuator records across service peers.
#[derive(Parser)]
#[command(name = "cluster-actuator", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Serve health metrics and keep peer membership warm until signalled.
    Serve,

    /// Print the cluster-wide node view as JSON.
    Nodes,

    /// Query records from every peer and print the merged result as JSON.
    Records {
        /// Record kind (log, profile, nodeinfo).
        #[arg(long)]
        kind: String,

        /// Field path to order by (e.g. "log.ts").
        #[arg(long)]
        sort: Option<String>,

        /// Sort direction (asc or desc).
        #[arg(long, default_value = "asc")]
        direction: Direction,

        /// Maximum number of merged records.
        #[arg(long)]
        limit: Option<usize>,

        /// Filter of the form "<path> <op> <value>", e.g. "log.level >= WARN".
        #[arg(long)]
        filter: Option<String>,

        /// Deadline for the whole fan-out (e.g. "2s", "500ms").
        #[arg(long, value_parser = parse_duration)]
        deadline: Option<Duration>,
    },
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("cluster-actuator {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing. Logs go to stderr so command output stays parseable.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let command = cli.command.unwrap_or(Command::Serve);

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        if cfg.discovery.static_endpoints.is_empty() {
            let control_plane = KubernetesControlPlane::new(&cfg.discovery)?;
            run(cfg, control_plane, command).await
        } else {
            let endpoints = cfg.discovery.parsed_static_endpoints()?;
            run(cfg, StaticControlPlane::new(endpoints), command).await
        }
    })
}

async fn run<C: ControlPlane + 'static>(
    cfg: Config,
    control_plane: C,
    command: Command,
) -> Result<()> {
    let metrics = Arc::new(ActuatorMetrics::new(&cfg.health.addr)?);

    let directory = Arc::new(
        EndpointDirectory::new(control_plane, cfg.discovery.cache_ttl)
            .with_metrics(Arc::clone(&metrics)),
    );
    let fetcher = Arc::new(HttpFetcher::new(&cfg.aggregation)?);
    let actuator = ClusterActuator::new(
        Arc::clone(&directory),
        Aggregator::new(fetcher).with_metrics(Arc::clone(&metrics)),
        cfg.node.descriptor(),
        ServiceRef {
            namespace: cfg.discovery.namespace.clone(),
            name: cfg.discovery.service_name.clone(),
        },
        cfg.aggregation.clone(),
    )
    .with_metrics(Arc::clone(&metrics));

    let ctx = SecurityContext::trusted("cli");

    match command {
        Command::Version => Ok(()),
        Command::Nodes => {
            let aggregation = actuator.aggregate_cluster_info(&ctx).await?;
            print_json(&aggregation)
        }
        Command::Records {
            kind,
            sort,
            direction,
            limit,
            filter,
            deadline,
        } => {
            let query = RecordQuery {
                kind,
                filter,
                sort_field: sort,
                direction,
                limit,
                deadline,
            };
            let aggregation = actuator.aggregate_records(&ctx, query).await?;
            print_json(&aggregation)
        }
        Command::Serve => serve(&cfg, directory, metrics).await,
    }
}

fn print_json(aggregation: &Aggregation) -> Result<()> {
    let out = serde_json::to_string_pretty(aggregation).context("encoding result")?;
    println!("{out}");
    Ok(())
}

async fn serve<C: ControlPlane + 'static>(
    cfg: &Config,
    directory: Arc<EndpointDirectory<C>>,
    metrics: Arc<ActuatorMetrics>,
) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        node_id = %cfg.node.node_id,
        service = %cfg.discovery.service_name,
        "starting cluster-actuator",
    );

    metrics.start().await?;

    let cancel = CancellationToken::new();
    let refresh = tokio::spawn(refresh_membership(
        directory,
        cfg.discovery.namespace.clone(),
        cfg.discovery.service_name.clone(),
        cfg.discovery.refresh_interval,
        cancel.clone(),
    ));

    wait_for_shutdown().await?;

    cancel.cancel();
    if let Err(e) = refresh.await {
        tracing::warn!(error = %e, "membership refresh task failed");
    }
    metrics.stop().await?;

    tracing::info!("cluster-actuator stopped");

    Ok(())
}

/// Periodically re-resolves the peer set so an outage can fall back to a
/// recent snapshot.
async fn refresh_membership<C: ControlPlane>(
    directory: Arc<EndpointDirectory<C>>,
    namespace: String,
    service: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_count = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match directory
            .resolve(&namespace, &service, Freshness::RequireFresh)
            .await
        {
            Ok(endpoints) => {
                if last_count != Some(endpoints.len()) {
                    tracing::info!(peers = endpoints.len(), "peer membership changed");
                    last_count = Some(endpoints.len());
                }
            }
            Err(DiscoveryError::ServiceNotFound { .. }) => {
                if last_count != Some(0) {
                    tracing::warn!(%namespace, %service, "service has no registered peers");
                    last_count = Some(0);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "membership refresh failed");
            }
        }
    }
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}
