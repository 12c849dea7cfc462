use std::sync::Arc;

use chrono::Utc;
use diesel_async::pooled_connection::deadpool::BuildError;
use dotenv::dotenv;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::alerting::{Alert, AlertError, AlertSink, DiscordAlerter};
use crate::classifier::bungie::{build_rate_limiter, BungieClassifier, ClassifierError};
use crate::cli::Cli;
use crate::config::{Config, ConfigError, CrawlSettings};
use crate::crawler::types::INITIAL_PERIOD_LENGTH;
use crate::crawler::{
    spawn_offload_pool, CrawlContext, CrawlTimings, Crawler, Cursor, CycleController,
    GapDetector, GapSettings,
};
use crate::db::{build_db_pool, LatestInstanceLookup, LookupError, PgLatestInstanceLookup};
use crate::ledger::{FileMissedLedger, LedgerError};
use crate::logging::init_logging;
use crate::metrics_provider::prometheus::PrometheusClient;
use crate::metrics_provider::{MetricsError, MetricsProvider};
use crate::queue::{QueueError, RedisQueues};
use crate::server::setup_server;
use crate::state::AppState;

const SERVICE_NAME: &str = "atlas_crawler";

/// Startup and shutdown failures that end the process.
#[derive(Error, Debug)]
pub enum CrawlerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to build database pool: {0}")]
    DbPool(#[from] BuildError),

    #[error("failed to look up starting instance: {0}")]
    Lookup(#[from] LookupError),

    #[error("failed to set up queues: {0}")]
    Queue(#[from] QueueError),

    #[error("failed to open missed ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("failed to build classifier: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("failed to build alerter: {0}")]
    Alert(#[from] AlertError),

    #[error("failed to build metrics client: {0}")]
    Metrics(#[from] MetricsError),

    #[error("failed to start metrics server: {0}")]
    Server(#[from] hyper::Error),

    #[error("crawl task failed: {0}")]
    Task(#[from] JoinError),
}

async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

/// Cancels `shutdown_token` on SIGTERM or SIGINT.
async fn handle_shutdown_signals(shutdown_token: CancellationToken) {
    match wait_for_shutdown_signal().await {
        Ok(name) => {
            info!(
                event = "shutdown_signal",
                signal = name,
                "signal received, stopping after in-flight batches"
            );
            shutdown_token.cancel();
        }
        Err(err) => error!(
            event = "signal_handler_failed",
            error = %err,
            "could not register signal handlers"
        ),
    }
}

/// Resolves the first id to crawl: an explicit target, or the newest stored
/// instance, minus the buffer.
async fn resolve_start(
    settings: &CrawlSettings,
    lookup: &dyn LatestInstanceLookup,
) -> Result<i64, CrawlerError> {
    let anchor = match settings.target {
        Some(target) => target,
        None => {
            let latest = lookup.latest_instance().await?;
            info!(
                event = "latest_instance_loaded",
                instance_id = latest.instance_id,
                completed_at = %latest.completed_at,
                lag_seconds = (Utc::now() - latest.completed_at).num_seconds(),
                "resuming from newest stored instance"
            );
            latest.instance_id
        }
    };
    Ok(anchor - settings.buffer)
}

pub async fn run(cli: Cli) -> Result<(), CrawlerError> {
    dotenv().ok();
    init_logging(SERVICE_NAME, cli.dev, "info");

    let settings = CrawlSettings::resolve(&cli)?;
    let config = Config::from_env()?;

    let pool = build_db_pool(&config.db_url).await?;
    let lookup = Arc::new(PgLatestInstanceLookup::new(pool));
    let start = resolve_start(&settings, lookup.as_ref()).await?;
    let cursor = Arc::new(Cursor::new(start, settings.skip));

    let shutdown_token = CancellationToken::new();
    let state = Arc::new(AppState::new(shutdown_token.clone()));
    let server_handle = setup_server(state, config.metrics_addr()).await?;
    info!(
        event = "metrics_server_started",
        bind = %config.metrics_addr(),
        "serving /metrics and /health"
    );

    let classifier = BungieClassifier::new(
        config.bungie_url.clone(),
        &config.bungie_api_key,
        build_rate_limiter(config.fetch_rps),
    )?;
    let queues = Arc::new(RedisQueues::new(&config.redis_url)?);
    let ledger = FileMissedLedger::open(&config.missed_log_path).await?;
    info!(
        event = "missed_ledger_opened",
        path = %ledger.path().display(),
    );
    let alerts = Arc::new(DiscordAlerter::new(
        config.webhook_url.clone(),
        config.alerts_role_id.clone(),
    )?);
    let metrics = MetricsProvider::new(Arc::new(PrometheusClient::new(
        config.prometheus_url.clone(),
    )?));

    let ctx = Arc::new(CrawlContext {
        classifier: Arc::new(classifier),
        publisher: queues.clone(),
        blocked: queues,
        ledger: Arc::new(ledger),
        alerts: alerts.clone(),
        timings: CrawlTimings::default(),
    });

    let (offload, offload_pool) =
        spawn_offload_pool(ctx.clone(), config.offload, shutdown_token.clone());
    let crawler = Crawler::new(ctx, offload, cursor.clone());

    alerts
        .notify(Alert::Startup {
            cursor: cursor.load(),
            workers: settings.initial_workers,
            period_length: INITIAL_PERIOD_LENGTH,
            dev: settings.dev,
        })
        .await;

    let controller = CycleController::new(
        crawler.clone(),
        metrics.clone(),
        settings.bounds,
        settings.initial_workers,
        shutdown_token.clone(),
    );
    let gap_detector = GapDetector::new(
        crawler,
        metrics,
        lookup,
        GapSettings::default(),
        shutdown_token.clone(),
    );

    let signal_handle = tokio::spawn(handle_shutdown_signals(shutdown_token.clone()));
    let controller_handle = tokio::spawn(controller.run());
    let gap_handle = tokio::spawn(gap_detector.run());

    controller_handle.await?;
    gap_handle.await?;
    offload_pool.join().await;
    server_handle.await?;
    signal_handle.abort();

    info!(
        event = "crawler_stopped",
        cursor = cursor.load(),
        "crawler shut down"
    );
    Ok(())
}
