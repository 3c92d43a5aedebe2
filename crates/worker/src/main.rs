use std::sync::Arc;

use anyhow::Context;

use portaljobs_core::WorkerId;
use portaljobs_infra::jobs::{PostgresJobStore, TracingNotifier, TracingTelemetry, Worker, WorkerDeps};
use portaljobs_worker::app::{AppServices, build_app};
use portaljobs_worker::handlers::builtin_registry;
use portaljobs_worker::settings::Settings;
use portaljobs_worker::shutdown::{install_shutdown_handler, propagate};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("failed to load settings")?;
    portaljobs_observability::init(settings.log_format);

    let database_url = settings
        .engine
        .database_url
        .clone()
        .context("DATABASE_URL is not set")?;
    let store = Arc::new(
        PostgresJobStore::connect(&database_url)
            .await
            .context("failed to connect to postgres")?,
    );
    store.migrate().await.context("failed to apply schema")?;

    let worker_id = match &settings.engine.worker_id {
        Some(id) => WorkerId::new(id.clone())?,
        None => WorkerId::generate(),
    };

    let telemetry = Arc::new(TracingTelemetry::new());
    let deps = WorkerDeps {
        jobs: store.clone(),
        slots: store.clone(),
        ledger: store.clone(),
        registry: Arc::new(builtin_registry()),
        notifier: Arc::new(TracingNotifier),
        telemetry: telemetry.clone(),
    };
    let worker = Worker::new(&settings.engine, worker_id, deps);
    let producer = worker.producer();
    let budget = worker.budget();
    let handle = worker.start().await.context("failed to start worker")?;

    let shutdown = install_shutdown_handler();
    propagate(&shutdown, handle.cancellation_token());
    let app = build_app(AppServices {
        jobs: store.clone(),
        producer,
        worker: handle.clone(),
        budget,
        telemetry,
    });

    let listener = tokio::net::TcpListener::bind(settings.admin_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.admin_addr))?;
    tracing::info!(addr = %listener.local_addr()?, worker = %handle.worker_id(), "admin listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("admin server failed")?;

    // Claiming already stopped on the signal; wait for in-flight jobs.
    handle.shutdown().await;
    Ok(())
}
