use api_router::{api_routes, ApiState};
use axum::Router;
use common::{
    storage::{db::SurrealDbClient, store::StorageManager, types::generation_job::GenerationJob},
    utils::config::{get_config, AppConfig},
};
use generation_pipeline::{
    spawn_worker_pool, GenerationLimits, GenerationWorker, GeneratorHandle, JobCoordinator,
};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    // Ensure db is initialized
    db.ensure_initialized().await?;

    // No worker survives a restart, so anything still generating is lost
    let interrupted = GenerationJob::fail_interrupted(&db).await?;
    if !interrupted.is_empty() {
        warn!(
            count = interrupted.len(),
            "Marked jobs interrupted by the previous shutdown as failed"
        );
    }

    let storage = StorageManager::new(&config).await?;
    info!(
        backend = ?storage.backend_kind(),
        data_dir = %config.data_dir,
        "Artifact storage initialized"
    );

    let generator = GeneratorHandle::remote(config.generator_url.clone());
    let app = build_app(&config, db, storage, generator);

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server stopped");
    Ok(())
}

/// Wires the worker pool, coordinator and HTTP routes together.
fn build_app(
    config: &AppConfig,
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    generator: GeneratorHandle,
) -> Router {
    let worker = Arc::new(GenerationWorker::new(
        Arc::<SurrealDbClient>::clone(&db),
        storage.clone(),
        Arc::new(generator),
        Duration::from_secs(config.generation_timeout_secs),
    ));
    let (queue, workers) = spawn_worker_pool(
        worker,
        config.generation_queue_capacity,
        config.generation_concurrency,
    );
    info!(
        workers = workers.len(),
        queue_capacity = config.generation_queue_capacity,
        "Generation workers started"
    );

    let coordinator = Arc::new(JobCoordinator::new(
        Arc::clone(&db),
        storage,
        queue,
        GenerationLimits::from(config),
    ));
    let api_state = ApiState::new(config, db, coordinator);

    Router::new().merge(api_routes()).with_state(api_state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
