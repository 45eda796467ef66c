//! Diskquota Segment Daemon
//!
//! Hosts the shard-local quota state: the storage-event probes, the
//! active-file map, the relation cache, the blocklist replica and the
//! stat service the coordinator fans out to.

mod service;

use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use clap::Parser;
use diskquota_activetable::ActiveTableTracker;
use diskquota_catalog::{CatalogManifest, MemoryCatalog, StorageEventHub};
use diskquota_common::{NodeRole, DEFAULT_MAX_ACTIVE_TABLES, MAX_NUM_MONITORED_DB};
use diskquota_proto::segment::segment_service_server::SegmentServiceServer;
use diskquota_quota::Blocklist;
use diskquota_relcache::RelationCache;
use diskquota_segment::{RelationSizer, SegmentStatService};
use diskquota_shmem::{MonitoredDbSet, PausedFlags};
use serde::Deserialize;
use service::SegmentRpcService;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "diskquota-segmentd")]
#[command(about = "Diskquota segment daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/diskquota/segmentd.toml")]
    config: String,

    /// Listen address for gRPC
    #[arg(short, long)]
    listen: Option<String>,

    /// Shard id of this segment
    #[arg(long)]
    seg_id: Option<i16>,

    /// Data directory holding relation files
    #[arg(long)]
    base_dir: Option<String>,

    /// Catalog manifest path
    #[arg(long)]
    catalog: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Metrics server port
    #[arg(long, default_value = "9202")]
    metrics_port: u16,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    segment: SegmentConfig,
    #[serde(default)]
    quota: QuotaConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct SegmentConfig {
    #[serde(default)]
    seg_id: i16,
    #[serde(default = "default_role")]
    role: NodeRole,
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default = "default_base_dir")]
    base_dir: String,
    #[serde(default = "default_catalog")]
    catalog_manifest: String,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            seg_id: 0,
            role: default_role(),
            listen: default_listen(),
            base_dir: default_base_dir(),
            catalog_manifest: default_catalog(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QuotaConfig {
    #[serde(default = "default_max_active_tables")]
    max_active_tables: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_active_tables: default_max_active_tables(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

fn default_role() -> NodeRole {
    NodeRole::Segment
}

fn default_listen() -> String {
    "0.0.0.0:9102".to_string()
}

fn default_base_dir() -> String {
    "./segment-data".to_string()
}

fn default_catalog() -> String {
    "./catalog.toml".to_string()
}

fn default_max_active_tables() -> usize {
    DEFAULT_MAX_ACTIVE_TABLES
}

fn default_log_level() -> String {
    "info".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {}", e);
            Config::default()
        })
    } else {
        Config::default()
    };

    let listen = args.listen.unwrap_or(config.segment.listen);
    let seg_id = args.seg_id.unwrap_or(config.segment.seg_id);
    let base_dir = args.base_dir.unwrap_or(config.segment.base_dir);
    let manifest_path = args.catalog.unwrap_or(config.segment.catalog_manifest);
    let log_level = if args.log_level != "info" {
        args.log_level
    } else {
        config.logging.level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting diskquota segment daemon");
    info!("Config file: {}", args.config);
    info!("Segment id: {}, role: {:?}", seg_id, config.segment.role);
    info!("Base dir: {}", base_dir);

    let hub = Arc::new(StorageEventHub::new());
    let catalog: Arc<MemoryCatalog> = Arc::new(
        CatalogManifest::load(&manifest_path)
            .map_err(anyhow::Error::msg)
            .context("loading catalog manifest")?
            .build(hub.clone()),
    );

    let monitored = Arc::new(MonitoredDbSet::new(MAX_NUM_MONITORED_DB));
    let paused = Arc::new(PausedFlags::new());
    let blocklist = Arc::new(Blocklist::new());
    let relcache = Arc::new(RelationCache::new(config.quota.max_active_tables));
    let tracker = Arc::new(ActiveTableTracker::new(
        config.segment.role,
        config.quota.max_active_tables,
        monitored.clone(),
        relcache.clone(),
        catalog.clone(),
    ));
    hub.register(tracker.clone());
    service::warn_if_not_segment(config.segment.role);

    let sizer = RelationSizer::new(&base_dir, catalog.clone());
    let stat = Arc::new(SegmentStatService::new(
        seg_id,
        config.segment.role,
        tracker.clone(),
        relcache.clone(),
        catalog.clone(),
        sizer,
    ));

    let rpc = SegmentRpcService::new(stat, monitored.clone(), paused, blocklist.clone());

    // metrics sidecar
    let metrics_state = Arc::new(MetricsState {
        seg_id,
        tracker,
        relcache,
        blocklist,
        monitored,
        start_time: Instant::now(),
    });
    let metrics_port = args.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = serve_metrics(metrics_port, metrics_state).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address {listen}"))?;
    info!("Starting gRPC server on {}", addr);
    info!("Metrics available at http://0.0.0.0:{}/metrics", metrics_port);

    Server::builder()
        .add_service(SegmentServiceServer::new(rpc))
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    info!("Segment daemon shut down gracefully");
    Ok(())
}

struct MetricsState {
    seg_id: i16,
    tracker: Arc<ActiveTableTracker>,
    relcache: Arc<RelationCache>,
    blocklist: Arc<Blocklist>,
    monitored: Arc<MonitoredDbSet>,
    start_time: Instant,
}

async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<Arc<MetricsState>>,
) -> impl IntoResponse {
    let mut output = String::with_capacity(2 * 1024);
    let seg = state.seg_id;

    writeln!(output, "# HELP diskquota_segment_uptime_seconds Daemon uptime").unwrap();
    writeln!(output, "# TYPE diskquota_segment_uptime_seconds counter").unwrap();
    writeln!(
        output,
        "diskquota_segment_uptime_seconds{{seg_id=\"{}\"}} {}",
        seg,
        state.start_time.elapsed().as_secs()
    )
    .unwrap();

    writeln!(output, "# HELP diskquota_active_tables Entries in the active-file map").unwrap();
    writeln!(output, "# TYPE diskquota_active_tables gauge").unwrap();
    writeln!(
        output,
        "diskquota_active_tables{{seg_id=\"{}\"}} {}",
        seg,
        state.tracker.len()
    )
    .unwrap();

    writeln!(output, "# HELP diskquota_active_tables_dropped_total Probe events dropped on overflow").unwrap();
    writeln!(output, "# TYPE diskquota_active_tables_dropped_total counter").unwrap();
    writeln!(
        output,
        "diskquota_active_tables_dropped_total{{seg_id=\"{}\"}} {}",
        seg,
        state.tracker.dropped()
    )
    .unwrap();

    writeln!(output, "# HELP diskquota_relation_cache_entries Relation cache entries").unwrap();
    writeln!(output, "# TYPE diskquota_relation_cache_entries gauge").unwrap();
    writeln!(
        output,
        "diskquota_relation_cache_entries{{seg_id=\"{}\"}} {}",
        seg,
        state.relcache.len()
    )
    .unwrap();

    writeln!(output, "# HELP diskquota_blocklist_entries Blocklist entries on this node").unwrap();
    writeln!(output, "# TYPE diskquota_blocklist_entries gauge").unwrap();
    writeln!(
        output,
        "diskquota_blocklist_entries{{seg_id=\"{}\"}} {}",
        seg,
        state.blocklist.len()
    )
    .unwrap();

    writeln!(output, "# HELP diskquota_monitored_databases Monitored databases").unwrap();
    writeln!(output, "# TYPE diskquota_monitored_databases gauge").unwrap();
    writeln!(
        output,
        "diskquota_monitored_databases{{seg_id=\"{}\"}} {}",
        seg,
        state.monitored.len()
    )
    .unwrap();

    (StatusCode::OK, output)
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn serve_metrics(port: u16, state: Arc<MetricsState>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
