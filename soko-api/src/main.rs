use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use soko_api::control::ControlService;
use soko_api::telegram::TelegramClient;
use soko_api::worker::{self, TimetableSchedule};
use soko_api::{app, AppState, WEBHOOK_PATH};
use soko_booking::{BookingService, CleanupService, TimetableReconciler};
use soko_core::repository::TrainRepository;
use soko_core::time::{Clock, SystemClock};
use soko_store::app_config::Config;
use soko_store::{DbClient, PostgresTrainRepository, SrbvozTimetableLoader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "soko_api=debug,soko_booking=debug,soko_store=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Soko bot on port {}", config.server.port);

    // Database
    let db = DbClient::new(config.database.url.expose(), config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    let repo: Arc<dyn TrainRepository> = Arc::new(PostgresTrainRepository::new(db.pool.clone()));

    // Collaborators
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let telegram = Arc::new(TelegramClient::new(
        &config.telegram.api_url,
        config.telegram.bot_token.expose(),
    ));
    let loader = Arc::new(SrbvozTimetableLoader::new(&config.timetable).context("Failed to build HTTP client")?);

    // Services
    let booking = Arc::new(BookingService::new(repo.clone()));
    let control = Arc::new(ControlService::new(booking, telegram.clone(), clock.clone()));
    let reconciler = Arc::new(TimetableReconciler::new(repo.clone(), loader, clock.clone()));
    let cleanup = Arc::new(CleanupService::new(repo.clone(), clock));

    // Background workers
    let shutdown = CancellationToken::new();
    let schedule = TimetableSchedule {
        horizon_days: config.timetable.horizon_days,
        refresh_interval: config.timetable.refresh_interval(),
        retry_interval: config.timetable.retry_interval(),
    };
    let workers = vec![
        tokio::spawn(worker::start_timetable_worker(reconciler, schedule, shutdown.child_token())),
        tokio::spawn(worker::start_cleanup_worker(cleanup, config.cleanup.interval(), shutdown.child_token())),
    ];

    let app_state = AppState {
        control,
        repo,
        webhook_secret: config.telegram.secret_token.clone(),
    };
    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Listening on {}", addr);

    let webhook_url = format!("{}{}", config.telegram.webhook_host.trim_end_matches('/'), WEBHOOK_PATH);
    telegram
        .set_webhook(&webhook_url, config.telegram.secret_token.expose())
        .await
        .context("Failed to register webhook")?;

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
            signal.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    for handle in futures_util::future::join_all(workers).await {
        if let Err(e) = handle {
            tracing::error!("Worker panicked: {}", e);
        }
    }

    if let Err(e) = telegram.delete_webhook().await {
        tracing::warn!("Failed to remove webhook: {}", e);
    }
    tracing::info!("Stopped");
    Ok(())
}
