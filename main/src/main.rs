use std::sync::Arc;
use std::time::Duration;

use api_router::{api_routes, api_state::ApiState};
use common::{
    storage::{
        db::SurrealDbClient,
        types::job::{JobStore, JobSubmitter},
        vector_store::HttpVectorStore,
    },
    telemetry::TelemetrySink,
    utils::{
        config::{get_config, AppConfig},
        embedding::{EmbeddingBackend, OpenAiEmbedder},
        retry::RetryPolicy,
    },
};
use ingestion_pipeline::pipeline::stages::{
    ChunkStage, CleanConfig, CleanStage, EmbedStage, FetchStage, StoreStage,
};
use ingestion_pipeline::scheduler::JobScheduler;
use ingestion_pipeline::{JobExecutor, PipelineOrchestrator};
use source_adapters::AdapterRegistry;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Connect to the configured store, retrying briefly; fall back to the
/// in-memory engine so the service can still accept work. In-memory jobs
/// do not survive a restart.
async fn connect_database(config: &AppConfig) -> Result<Arc<SurrealDbClient>, surrealdb::Error> {
    let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);

    let connected = Retry::spawn(retry_strategy, || {
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
    })
    .await;

    match connected {
        Ok(db) => Ok(Arc::new(db)),
        Err(err) => {
            warn!(
                address = %config.surrealdb_address,
                error = %err,
                "database unreachable, degrading to in-memory job store"
            );
            Ok(Arc::new(
                SurrealDbClient::memory(&config.surrealdb_namespace, &config.surrealdb_database)
                    .await?,
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = connect_database(&config).await?;
    db.ensure_initialized().await?;

    let telemetry = TelemetrySink::new(Arc::clone(&db), true);
    let job_store = JobStore::new(Arc::clone(&db));
    let retry_policy = RetryPolicy::from_config(&config);

    let registry = Arc::new(AdapterRegistry::from_config(&config)?);

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));
    let embedder = Arc::new(OpenAiEmbedder::new(
        openai_client,
        &config.openai_embedding_model,
    ));
    info!(
        model = %config.openai_embedding_model,
        dimension = embedder.dimension(),
        "embedding backend initialized"
    );

    let vector_store = Arc::new(HttpVectorStore::new(
        &config.vector_store_base_url,
        Duration::from_secs(config.vector_store_timeout_secs),
    )?);

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        FetchStage::new(Arc::clone(&registry), retry_policy, telemetry.clone()),
        CleanStage::new(CleanConfig::default(), telemetry.clone())?,
        ChunkStage::from_config(&config, telemetry.clone())?,
        EmbedStage::new(
            embedder,
            config.openai_batch_size,
            retry_policy,
            telemetry.clone(),
        ),
        StoreStage::new(Arc::clone(&vector_store) as _, telemetry.clone()),
        job_store.clone(),
        telemetry,
    ));

    let executor = Arc::new(JobExecutor::new(
        orchestrator,
        job_store.clone(),
        config.max_workers,
    ));

    // Jobs interrupted by the previous shutdown are failed, not re-run
    let recovered = executor.recover_interrupted().await?;
    if recovered > 0 {
        warn!(recovered, "jobs interrupted by restart were marked failed");
    }

    let _scheduler = if config.scheduler_enabled {
        info!("scheduler enabled");
        Some(Arc::new(JobScheduler::new(
            Arc::clone(&executor),
            job_store.clone(),
        )))
    } else {
        None
    };

    let state = ApiState::new(
        db,
        config.clone(),
        Arc::clone(&executor) as Arc<dyn JobSubmitter>,
        vector_store,
    );

    let app = api_routes(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.rake_port)).await?;
    info!(port = config.rake_port, "rake ingestion service listening");

    axum::serve(listener, app).await?;

    Ok(())
}
