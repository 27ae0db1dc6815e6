use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use fanet_backend::auth::JwtVerifier;
use fanet_backend::broadcast::BroadcastManager;
use fanet_backend::bus::NatsBusSource;
use fanet_backend::config::AppConfig;
use fanet_backend::history::HistoryRepository;
use fanet_backend::hot_cache::RedisHotCache;
use fanet_backend::instance_lock::InstanceLock;
use fanet_backend::orchestrator::{Orchestrator, run_expiry_sweep, run_ingest_loop};
use fanet_backend::query::QueryService;
use fanet_backend::web::{AppState, start_web_server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fanet-backend", version, about = "FANET realtime telemetry backend")]
struct Cli {
    #[arg(long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingest pipeline: bus consumer, hot cache, history, broadcast dispatcher.
    Run,
    /// Run the HTTP + WebSocket delivery layer alone.
    ServeWeb,
    /// Run the Prometheus metrics endpoint alone.
    ServeMetrics,
    /// Load and validate the configuration file, then exit.
    ValidateConfig,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().event_format(fanet_backend::log_format::TargetFirstFormat).with_env_filter(filter).init();
}

fn init_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            traces_sample_rate: 0.1,
            ..Default::default()
        },
    )))
}

fn build_pg_pool(database_url: &str, pool_size: u32) -> Result<Pool<ConnectionManager<PgConnection>>> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().max_size(pool_size).build(manager).context("building Postgres connection pool")
}

async fn build_shared_state(config: &AppConfig) -> Result<(Arc<Orchestrator>, Arc<BroadcastManager>, QueryService)> {
    let hot_cache = Arc::new(RedisHotCache::new(&config.hot_cache.redis_url).context("configuring hot cache")?);
    Arc::clone(&hot_cache).spawn_idle_flusher();

    let pg_pool = build_pg_pool(&config.history.database_url, config.history.pool_size)?;
    let history: Arc<dyn fanet_backend::history::HistoryPort> = Arc::new(HistoryRepository::new(pg_pool));

    let spatial_index = Arc::new(fanet_backend::orchestrator::LiveIndex::new());
    let broadcast = BroadcastManager::new();

    let orchestrator = Arc::new(Orchestrator::new(hot_cache.clone(), history.clone(), spatial_index.clone(), broadcast.clone()));
    let query_service = QueryService::new(spatial_index, hot_cache, history);

    Ok((orchestrator, broadcast, query_service))
}

async fn run(config: AppConfig) -> Result<()> {
    let _lock = InstanceLock::new("fanet-backend-run").context("acquiring instance lock")?;
    info!("acquired instance lock");

    let (orchestrator, broadcast, _query_service) = build_shared_state(&config).await?;

    let cancel = CancellationToken::new();
    let dispatcher = tokio::spawn(Arc::clone(&broadcast).run_dispatcher(cancel.clone()));
    let cleanup = tokio::spawn(Arc::clone(&broadcast).run_cleanup(cancel.clone()));
    let expiry_sweep = tokio::spawn(run_expiry_sweep(Arc::clone(&orchestrator), std::time::Duration::from_secs(60), cancel.clone()));

    let bus = NatsBusSource::connect(&config.bus.nats_url, &config.bus.subject).await.context("connecting to message bus")?;

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            cancel_for_signal.cancel();
        }
    });

    run_ingest_loop(orchestrator, Box::new(bus), cancel.clone()).await;
    cancel.cancel();
    let _ = dispatcher.await;
    let _ = cleanup.await;
    let _ = expiry_sweep.await;
    Ok(())
}

async fn serve_web(config: AppConfig) -> Result<()> {
    let (orchestrator, broadcast, query_service) = build_shared_state(&config).await?;

    let token_verifier: Arc<dyn fanet_backend::auth::TokenVerifier> = Arc::new(JwtVerifier::from_env().unwrap_or_else(|err| {
        error!(%err, "JWT_SECRET not configured, using an ephemeral development secret");
        JwtVerifier::new("development-secret-do-not-use-in-production")
    }));

    let state = AppState {
        query_service: Arc::new(query_service),
        orchestrator,
        broadcast,
        token_verifier,
    };

    start_web_server(config.web.interface.clone(), config.web.port, state).await
}

async fn serve_metrics(config: AppConfig) -> Result<()> {
    fanet_backend::metrics::start_metrics_server(config.metrics.port).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let _sentry_guard = init_sentry();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config).context("loading configuration")?;

    let result = match cli.command {
        Commands::Run => run(config).await,
        Commands::ServeWeb => serve_web(config).await,
        Commands::ServeMetrics => serve_metrics(config).await,
        Commands::ValidateConfig => {
            info!("configuration is valid");
            Ok(())
        }
    };

    if let Err(err) = &result {
        error!(%err, "fatal error");
    }
    result
}
