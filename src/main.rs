use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use thread_pin_watcher::collaborators::Collaborators;
use thread_pin_watcher::config::Config;
use thread_pin_watcher::manager::SchedulerOptions;
use thread_pin_watcher::platform::{IntervalWakeScheduler, LoggingNotifier, LoggingSleepGuard};
use thread_pin_watcher::service::WatchService;
use thread_pin_watcher::source::{BoardPageCache, HttpThreadSource, SavedReplies};
use thread_pin_watcher::store::SqlitePinStore;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting pin-watcher");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        api = %config.thread_api_base_url,
        database = %config.database_path.display(),
        watch_enabled = config.settings.watch_enabled,
        background_enabled = config.settings.background_enabled,
        "Configuration loaded"
    );

    let store = Arc::new(
        SqlitePinStore::open(&config.database_path)
            .await
            .context("Failed to open pin database")?,
    );

    let saved = Arc::new(SavedReplies::default());
    for (thread, post_no) in &config.saved_replies {
        saved.add(thread, *post_no);
    }
    if !saved.is_empty() {
        info!(count = saved.len(), "Loaded saved replies");
    }
    let threads = Arc::new(HttpThreadSource::new(
        &config.thread_api_base_url,
        config.min_thread_poll_interval,
        saved,
    )?);
    let pages = Arc::new(BoardPageCache::new(
        &config.thread_api_base_url,
        config.page_cache_ttl,
    )?);
    let wake = IntervalWakeScheduler::new();
    let notifier = Arc::new(LoggingNotifier::default());

    let collab = Collaborators {
        threads,
        pages,
        store: store.clone(),
        sleep: Arc::new(LoggingSleepGuard::default()),
        wake: Arc::new(wake.clone()),
        presence: notifier.clone(),
        last_page: notifier,
    };

    let shutdown = CancellationToken::new();

    let wake_handle = tokio::spawn(
        wake.run(config.background_wake_interval, shutdown.clone()),
    );

    let service = WatchService::start(
        SchedulerOptions::from_config(&config),
        collab,
        shutdown.clone(),
    )
    .await?;
    let handle = service.handle();

    for thread in &config.seed_pins {
        match handle.pin_thread(thread.clone()).await {
            Ok(true) => info!(%thread, "Pinned seed thread"),
            Ok(false) => info!(%thread, "Seed thread already pinned"),
            Err(e) => warn!(%thread, "Failed to pin seed thread: {e}"),
        }
    }

    info!("Watching pinned threads, press Ctrl+C to stop");

    shutdown_signal().await;
    info!("Shutdown signal received");

    shutdown.cancel();
    service.stopped().await?;
    if let Err(e) = wake_handle.await {
        warn!("Wake scheduler task failed: {e}");
    }
    store.flush().await.context("Failed to flush pins")?;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,thread_pin_watcher=debug"));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
