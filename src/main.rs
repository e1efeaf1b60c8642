//! Application entry point for the `airwatch-pipeline` service.
//!
//! This binary orchestrates the full startup sequence, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool and creating the schema
//! - Connecting the Redis stream consumers and producers
//! - Spawning the stream processor and/or the notifier (alert consumer,
//!   broadcast hub, HTTP surface) according to `PIPELINE_ROLE`
//! - Cancelling every loop on SIGINT / SIGTERM and waiting for them to exit
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `REDIS_URL` (**required**) – Redis server hosting the streams
//! - `PIPELINE_ROLE` (optional) – processor | notifier | all (default: all)
//! - `LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `LOG_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config.rs` for the full list.
use std::{env, io::IsTerminal, net::SocketAddr, sync::Arc};

use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::Result;

use airwatch_pipeline::broker::{RedisStreamConsumer, RedisStreamPublisher};
use airwatch_pipeline::hub::{self, AlertConsumerSettings, Hub};
use airwatch_pipeline::processor::{ProcessorSettings, StreamProcessor};
use airwatch_pipeline::routes::{self, AppState};
use airwatch_pipeline::store::{CachedWindowStore, PgStore, Store};
use airwatch_pipeline::{config, schema, Config};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let store: Arc<dyn Store> = if cfg.window_cache_ttl.is_zero() {
        Arc::new(PgStore::new(pool.clone()))
    } else {
        Arc::new(CachedWindowStore::new(
            PgStore::new(pool.clone()),
            cfg.window_cache_ttl,
        ))
    };

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    if cfg.role.runs_processor() {
        spawn_processor(&cfg, store.clone(), cancel.clone(), &mut tasks).await?;
    }
    if cfg.role.runs_notifier() {
        spawn_notifier(&cfg, store.clone(), cancel.clone(), &mut tasks).await?;
    }

    shutdown_signal().await;
    tracing::info!("Shutting down...");
    cancel.cancel();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Task ended abnormally: {}", e);
        }
    }

    pool.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

// ---

async fn spawn_processor(
    cfg: &Config,
    store: Arc<dyn Store>,
    cancel: CancellationToken,
    tasks: &mut JoinSet<()>,
) -> Result<()> {
    // ---
    let source = RedisStreamConsumer::connect(
        &cfg.redis_url,
        &cfg.raw_stream,
        &cfg.processor_group,
        &cfg.consumer_name,
    )
    .await?;
    let sink = RedisStreamPublisher::connect(&cfg.redis_url, &cfg.alert_stream).await?;

    let settings = ProcessorSettings {
        fetch_timeout: cfg.fetch_timeout,
        publish_timeout: cfg.publish_timeout,
        store_timeout: cfg.store_timeout,
        ..ProcessorSettings::default()
    };
    let processor = StreamProcessor::new(Arc::new(source), Arc::new(sink), store, settings);

    tasks.spawn(async move { processor.run(cancel).await });
    Ok(())
}

async fn spawn_notifier(
    cfg: &Config,
    store: Arc<dyn Store>,
    cancel: CancellationToken,
    tasks: &mut JoinSet<()>,
) -> Result<()> {
    // ---
    let source = RedisStreamConsumer::connect(
        &cfg.redis_url,
        &cfg.alert_stream,
        &cfg.notifier_group,
        &cfg.consumer_name,
    )
    .await?;

    let (coordinator, handle) = Hub::new(cfg.subscriber_buffer);
    tasks.spawn(coordinator.run(cancel.clone()));

    let settings = AlertConsumerSettings {
        fetch_timeout: cfg.alert_fetch_timeout,
        ..AlertConsumerSettings::default()
    };
    tasks.spawn(hub::consume_alerts(
        Arc::new(source),
        handle.clone(),
        settings,
        cancel.clone(),
    ));

    let app = routes::router(AppState {
        store,
        hub: handle,
        store_timeout: cfg.store_timeout,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    tasks.spawn(async move {
        let shutdown = cancel.clone();
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            tracing::error!("HTTP server error: {}", e);
            cancel.cancel();
        }
    });
    Ok(())
}

/// Resolve on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `LOG_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() {
    // ---
    let span_events = match env::var("LOG_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("LOG_LEVEL")
            .ok()
            .map(|l| l.to_ascii_lowercase())
            .as_deref()
        {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
