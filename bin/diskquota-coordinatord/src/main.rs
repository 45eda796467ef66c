//! Diskquota Coordinator Daemon
//!
//! Runs the launcher and the per-database quota workers, fans stat calls
//! out to the segments each epoch, and serves the management API.

mod dispatch;
mod fanout;
mod launcher;
mod service;
mod worker;

use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use clap::Parser;
use diskquota_catalog::{CatalogManifest, MemoryCatalog, StorageEventHub};
use diskquota_common::{SchemaVersion, DEFAULT_NAPTIME_SECS};
use diskquota_proto::manage::management_service_server::ManagementServiceServer;
use diskquota_quota::Blocklist;
use diskquota_segment::RelationSizer;
use diskquota_shmem::{DdlMailbox, PausedFlags};
use diskquota_store::QuotaStore;
use dispatch::GrpcDispatcher;
use fanout::Fanout;
use launcher::{Launcher, WorkerDeps};
use serde::Deserialize;
use service::ManagementRpcService;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "diskquota-coordinatord")]
#[command(about = "Diskquota coordinator daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/diskquota/coordinatord.toml")]
    config: String,

    /// Listen address for the management gRPC API
    #[arg(short, long)]
    listen: Option<String>,

    /// Segment endpoints (http://host:port), in shard order
    #[arg(long)]
    segment: Vec<String>,

    /// Worker refresh interval in seconds
    #[arg(long)]
    naptime: Option<u64>,

    /// Store path
    #[arg(long)]
    store: Option<String>,

    /// Catalog manifest path
    #[arg(long)]
    catalog: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Metrics server port
    #[arg(long, default_value = "9201")]
    metrics_port: u16,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    coordinator: CoordinatorConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct CoordinatorConfig {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default)]
    segments: Vec<String>,
    #[serde(default = "default_naptime")]
    naptime_secs: u64,
    #[serde(default = "default_store")]
    store_path: String,
    #[serde(default = "default_catalog")]
    catalog_manifest: String,
    #[serde(default = "default_base_dir")]
    base_dir: String,
    #[serde(default = "default_schema_version")]
    schema_version: SchemaVersion,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            segments: Vec::new(),
            naptime_secs: default_naptime(),
            store_path: default_store(),
            catalog_manifest: default_catalog(),
            base_dir: default_base_dir(),
            schema_version: default_schema_version(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

fn default_listen() -> String {
    "0.0.0.0:9101".to_string()
}

fn default_naptime() -> u64 {
    DEFAULT_NAPTIME_SECS
}

fn default_store() -> String {
    "./coordinator-data/quota.redb".to_string()
}

fn default_catalog() -> String {
    "./catalog.toml".to_string()
}

fn default_base_dir() -> String {
    "./coordinator-data".to_string()
}

fn default_schema_version() -> SchemaVersion {
    SchemaVersion::V2
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

    let listen = args.listen.unwrap_or(config.coordinator.listen);
    let segments = if args.segment.is_empty() {
        config.coordinator.segments
    } else {
        args.segment
    };
    let naptime = Duration::from_secs(
        args.naptime
            .unwrap_or(config.coordinator.naptime_secs)
            .max(1),
    );
    let store_path = args.store.unwrap_or(config.coordinator.store_path);
    let manifest_path = args.catalog.unwrap_or(config.coordinator.catalog_manifest);
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

    info!("Starting diskquota coordinator daemon");
    info!("Config file: {}", args.config);
    info!("Segments: {:?}", segments);
    info!("Naptime: {:?}", naptime);
    info!("Store: {}", store_path);

    if segments.is_empty() {
        anyhow::bail!("no segment endpoints configured");
    }

    if let Some(parent) = std::path::Path::new(&store_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = Arc::new(QuotaStore::open(&store_path).context("opening quota store")?);

    let hub = Arc::new(StorageEventHub::new());
    let catalog: Arc<MemoryCatalog> = Arc::new(
        CatalogManifest::load(&manifest_path)
            .map_err(anyhow::Error::msg)
            .context("loading catalog manifest")?
            .build(hub),
    );

    let dispatch = Arc::new(GrpcDispatcher::new(segments));
    let fanout = Arc::new(Fanout::new(dispatch, config.coordinator.schema_version));
    let blocklist = Arc::new(Blocklist::new());
    let paused = Arc::new(PausedFlags::new());
    let local_sizer = RelationSizer::new(&config.coordinator.base_dir, catalog.clone());

    let (mailbox, mailbox_rx) = DdlMailbox::new();
    let mailbox = Arc::new(mailbox);

    let deps = WorkerDeps {
        naptime,
        store: store.clone(),
        fanout: fanout.clone(),
        catalog: catalog.clone(),
        blocklist: blocklist.clone(),
        paused: paused.clone(),
    };
    let launcher = Launcher::spawn(deps, mailbox_rx).await;

    let service = ManagementRpcService::new(
        mailbox,
        launcher.clone(),
        store.clone(),
        catalog,
        fanout,
        paused,
        blocklist.clone(),
        local_sizer,
    );

    let metrics_state = Arc::new(MetricsState {
        launcher,
        blocklist,
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
    info!("Starting management gRPC server on {}", addr);
    info!("Metrics available at http://0.0.0.0:{}/metrics", metrics_port);

    Server::builder()
        .add_service(ManagementServiceServer::new(service))
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    info!("Coordinator daemon shut down gracefully");
    Ok(())
}

struct MetricsState {
    launcher: Arc<Launcher>,
    blocklist: Arc<Blocklist>,
    start_time: Instant,
}

async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<Arc<MetricsState>>,
) -> impl IntoResponse {
    let mut output = String::with_capacity(2 * 1024);

    writeln!(output, "# HELP diskquota_coordinator_uptime_seconds Daemon uptime").unwrap();
    writeln!(output, "# TYPE diskquota_coordinator_uptime_seconds counter").unwrap();
    writeln!(
        output,
        "diskquota_coordinator_uptime_seconds {}",
        state.start_time.elapsed().as_secs()
    )
    .unwrap();

    writeln!(output, "# HELP diskquota_monitored_databases Databases with an active worker").unwrap();
    writeln!(output, "# TYPE diskquota_monitored_databases gauge").unwrap();
    writeln!(
        output,
        "diskquota_monitored_databases {}",
        state.launcher.monitored().len()
    )
    .unwrap();

    writeln!(output, "# HELP diskquota_blocklist_entries Blocklist entries on the coordinator").unwrap();
    writeln!(output, "# TYPE diskquota_blocklist_entries gauge").unwrap();
    writeln!(output, "diskquota_blocklist_entries {}", state.blocklist.len()).unwrap();

    writeln!(output, "# HELP diskquota_worker_epoch Current refresh epoch per database").unwrap();
    writeln!(output, "# TYPE diskquota_worker_epoch counter").unwrap();
    for db in state.launcher.monitored().list() {
        if let Some(epoch) = state.launcher.current_epoch(db) {
            writeln!(output, "diskquota_worker_epoch{{db=\"{}\"}} {}", db, epoch).unwrap();
        }
    }

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
