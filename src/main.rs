use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use thermal::actions::DeletionRegistry;
use thermal::auth::TokenVerifier;
use thermal::config::Settings;
use thermal::db;
use thermal::devices_repo::DevicesRepository;
use thermal::flight_separator::{landing_config_from, FlightSeparator};
use thermal::flights_repo::FlightsRepository;
use thermal::gps_tcp::{GpsPipeline, GpsTcpServer};
use thermal::live::HubManager;
use thermal::point_processor::PointProcessor;
use thermal::points_repo::PointsRepository;
use thermal::queue::{QueueName, RedisQueue};
use thermal::races_repo::RacesRepository;
use thermal::retention::{spawn_dlq_reaper, spawn_retention_sweeper};
use thermal::validator::Validator;
use thermal::web::{self, AppState};

/// Queue families this process writes to the store. The scoring queue is
/// consumed by the analysis subsystem, not by this writer pool.
const WRITER_QUEUES: [QueueName; 3] = [
    QueueName::LivePoints,
    QueueName::UploadPoints,
    QueueName::FlymasterPoints,
];

/// Grace period for in-flight connection tasks after shutdown fires.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "thermal")]
#[command(about = "Live tracking ingestion and fan-out backbone")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run everything in one process: HTTP/WebSocket server, GPS TCP
    /// front-end, writer pool, fan-out hubs, and background sweeps
    Run {
        /// Port to bind the web server to
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Interface to bind the web server to
        #[arg(long, default_value = "0.0.0.0")]
        interface: String,
    },
    /// Run the web tier and writer pool without the GPS TCP front-end
    Web {
        #[arg(long, default_value = "8080")]
        port: u16,

        #[arg(long, default_value = "0.0.0.0")]
        interface: String,
    },
    /// Run only the GPS TCP front-end, feeding the shared queue
    Gps {},
}

struct Runtime {
    state: AppState,
    processor: PointProcessor,
    pipeline: GpsPipeline,
}

async fn build_runtime(
    settings: Arc<Settings>,
    shutdown: watch::Receiver<bool>,
) -> Result<Runtime> {
    let pools = db::connect(&settings)
        .await
        .context("Failed to connect to the store")?;
    let queue = RedisQueue::connect(&settings.redis_url)
        .await
        .context("Failed to connect to the queue backing store")?;

    let races_repo = RacesRepository::new(pools.primary.clone());
    let flights_repo = FlightsRepository::new(pools.primary.clone());
    let flights_repo_read = FlightsRepository::new(pools.read.clone());
    let points_repo = PointsRepository::new(pools.primary.clone());
    let points_repo_read = PointsRepository::new(pools.read.clone());
    let devices_repo = DevicesRepository::new(pools.primary.clone());

    let separator = FlightSeparator::new(flights_repo.clone(), landing_config_from(&settings));

    // Writer → separator feedback keeps the device cache fresh without
    // per-point store lookups
    let (feedback_tx, feedback_rx) = flume::bounded(4_096);
    separator.spawn_feedback_listener(feedback_rx);

    let validator = Validator::new(flights_repo.clone());
    let processor = PointProcessor::new(
        queue.clone(),
        validator,
        points_repo.clone(),
        flights_repo.clone(),
    )
    .with_summary_feedback(feedback_tx);

    let hub_manager = HubManager::new(
        points_repo_read,
        settings.broadcast_delay,
        settings.update_interval,
        shutdown.clone(),
    );

    let pipeline = GpsPipeline::new(
        queue.clone(),
        separator.clone(),
        races_repo.clone(),
        devices_repo,
        points_repo.clone(),
        flights_repo.clone(),
    );

    let state = AppState {
        verifier: TokenVerifier::new(&settings.secret_key),
        settings,
        pools,
        queue,
        races_repo,
        flights_repo,
        points_repo,
        flights_repo_read,
        separator,
        hub_manager,
        writer_stats: processor.stats(),
        deletions: DeletionRegistry::default(),
        shutdown,
    };

    Ok(Runtime {
        state,
        processor,
        pipeline,
    })
}

fn spawn_writers(
    processor: &PointProcessor,
    shutdown: &watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    WRITER_QUEUES
        .iter()
        .map(|&queue| {
            let worker = processor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker.run(queue, shutdown).await;
            })
        })
        .collect()
}

async fn run_service(settings: Arc<Settings>, port: u16, interface: String, with_gps: bool) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runtime = build_runtime(Arc::clone(&settings), shutdown_rx.clone()).await?;

    let mut writer_handles = spawn_writers(&runtime.processor, &shutdown_rx);

    writer_handles.push(spawn_retention_sweeper(
        runtime.state.flights_repo.clone(),
        runtime.state.points_repo.clone(),
        runtime.state.writer_stats.clone(),
        settings.live_retention_hours,
        shutdown_rx.clone(),
    ));
    writer_handles.push(spawn_dlq_reaper(
        runtime.state.queue.clone(),
        shutdown_rx.clone(),
    ));

    if with_gps && settings.gps_tcp_enabled {
        let server = GpsTcpServer::new(runtime.pipeline.clone(), &settings);
        let gps_port = settings.gps_tcp_port;
        let gps_shutdown = shutdown_rx.clone();
        writer_handles.push(tokio::spawn(async move {
            if let Err(e) = server.run(gps_port, gps_shutdown).await {
                error!(error = %e, "GPS TCP server failed");
            }
        }));
    }

    let web_state = runtime.state.clone();
    let web_shutdown = shutdown_rx.clone();
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, &interface, port, web_shutdown).await {
            error!(error = %e, "Web server failed");
        }
    });

    wait_for_shutdown().await;
    info!("Shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    // Writers finish their current batch; connection tasks get the grace
    // period to flush before the process exits
    let drain = async {
        let _ = web_handle.await;
        for handle in writer_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Grace period elapsed with tasks still running");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn run_gps_only(settings: Arc<Settings>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runtime = build_runtime(Arc::clone(&settings), shutdown_rx.clone()).await?;

    let server = GpsTcpServer::new(runtime.pipeline.clone(), &settings);
    let gps_port = settings.gps_tcp_port;
    let gps_shutdown = shutdown_rx.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = server.run(gps_port, gps_shutdown).await {
            error!(error = %e, "GPS TCP server failed");
        }
    });

    wait_for_shutdown().await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        warn!(error = %e, "Metrics recorder not installed");
    }

    let settings = Arc::new(Settings::from_env().context("Configuration incomplete")?);

    match cli.command {
        Commands::Run { port, interface } => {
            run_service(settings, port, interface, true).await
        }
        Commands::Web { port, interface } => {
            run_service(settings, port, interface, false).await
        }
        Commands::Gps {} => run_gps_only(settings).await,
    }
}
