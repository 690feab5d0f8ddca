mod logging;

use std::sync::Arc;
use std::time::Duration;

use dupescan_core::config::Config;
use dupescan_core::db::Db;
use dupescan_core::queue::JobQueue;
use dupescan_core::vector::QdrantVectorStore;
use dupescan_core::types::ScanConfig;
use dupescan_phases::{
    ClusterProcessor, Dispatcher, EmbedProcessor, IngestProcessor, PhaseProcessor, ProcessOutcome,
    RankProcessor, ScanOrchestrator, VerifyProcessor,
};
use dupescan_providers::{GithubSourceHost, HostedChatProvider, HostedEmbeddingProvider, RateLimiter};
use tracing::{error, info};

/// text-embedding-3-small's output dimension; the collections are created
/// once at startup and never resized, so this must match whatever embedding
/// model `EMBEDDING_MODEL` names.
const EMBEDDING_DIM: u64 = 1536;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = Config::from_env()?;

    let db = Arc::new(Db::connect(&config.database_url).await?);
    db.migrate().await?;
    info!("database migrated");

    let vector_store = QdrantVectorStore::new(&config.vector_store_url)?;
    vector_store
        .ensure_collections(
            EMBEDDING_DIM,
            &[config.code_collection.as_str(), config.intent_collection.as_str()],
        )
        .await?;
    let vector_store: Arc<dyn dupescan_core::vector::VectorStore> = Arc::new(vector_store);
    info!("vector collections ready");

    let source_host: Arc<dyn dupescan_providers::SourceHost> = Arc::new(GithubSourceHost::new(
        config.source_host_base_url.clone(),
        config.source_host_token.clone(),
        RateLimiter::new(
            config.rate_limit_max_concurrent,
            config.rate_limit_max_retries,
            config.rate_limit_base_backoff_ms,
        ),
    ));
    let embedding: Arc<dyn dupescan_providers::EmbeddingProvider> = Arc::new(HostedEmbeddingProvider::new(
        config.embedding_base_url.clone(),
        config.embedding_api_key.clone(),
        config.embedding_model.clone(),
        config.embedding_context_window,
        RateLimiter::new(
            config.rate_limit_max_concurrent,
            config.rate_limit_max_retries,
            config.rate_limit_base_backoff_ms,
        ),
    ));
    let chat: Arc<dyn dupescan_providers::ChatProvider> = Arc::new(HostedChatProvider::new(
        config.chat_base_url.clone(),
        config.chat_api_key.clone(),
        config.chat_model.clone(),
        RateLimiter::new(
            config.rate_limit_max_concurrent,
            config.rate_limit_max_retries,
            config.rate_limit_base_backoff_ms,
        ),
    ));

    let scan_config = ScanConfig {
        code_similarity_threshold: config.code_similarity_threshold,
        intent_similarity_threshold: config.intent_similarity_threshold,
        concurrency: config.phase_concurrency as usize,
        code_collection: config.code_collection.clone(),
        intent_collection: config.intent_collection.clone(),
        embed_batch_size: config.embed_batch_size as usize,
        intent_summary_via_llm: config.intent_summary_via_llm,
        cluster_search_limit: config.cluster_search_limit,
    };

    let mut dispatcher = Dispatcher::new();
    dispatcher
        .register(Arc::new(ScanOrchestrator::new(
            Arc::clone(&db),
            config.job_max_retries,
            config.job_base_backoff_ms,
        )))
        .register(Arc::new(IngestProcessor::new(
            Arc::clone(&db),
            Arc::clone(&source_host),
            config.job_max_retries,
            config.job_base_backoff_ms,
        )))
        .register(Arc::new(EmbedProcessor::new(
            Arc::clone(&db),
            Arc::clone(&source_host),
            Arc::clone(&embedding),
            Arc::clone(&chat),
            Arc::clone(&vector_store),
            scan_config.clone(),
            config.job_max_retries,
            config.job_base_backoff_ms,
        )))
        .register(Arc::new(ClusterProcessor::new(
            Arc::clone(&db),
            Arc::clone(&vector_store),
            scan_config.clone(),
            config.job_max_retries,
            config.job_base_backoff_ms,
        )))
        .register(Arc::new(VerifyProcessor::new(
            Arc::clone(&db),
            Arc::clone(&source_host),
            Arc::clone(&chat),
            scan_config.clone(),
            config.job_max_retries,
            config.job_base_backoff_ms,
        )))
        .register(Arc::new(RankProcessor::new(
            Arc::clone(&db),
            Arc::clone(&source_host),
            Arc::clone(&chat),
        )));

    info!(job_types = ?dispatcher.job_types(), "worker ready, polling queue");
    run_worker_loop(db, dispatcher, config.job_base_backoff_ms, config.worker_idle_sleep_ms).await
}

/// Cooperative polling loop: claim one claimable job, dispatch it to its
/// registered processor, record the outcome, and repeat. Sleeps when nothing
/// is claimable rather than busy-looping. Drains the in-flight job before
/// exiting on Ctrl-C.
async fn run_worker_loop(
    db: Arc<Db>,
    dispatcher: Dispatcher,
    job_base_backoff_ms: u64,
    idle_sleep_ms: u64,
) -> anyhow::Result<()> {
    let job_types = dispatcher.job_types();
    let mut shutdown = Box::pin(tokio::signal::ctrl_c());

    loop {
        let queue = JobQueue::new(&db, job_base_backoff_ms);

        let claimed = tokio::select! {
            claimed = queue.claim(&job_types) => claimed?,
            _ = &mut shutdown => {
                info!("shutdown signal received, no job in flight, exiting");
                return Ok(());
            }
        };

        let Some(job) = claimed else {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(idle_sleep_ms)) => {}
                _ = &mut shutdown => {
                    info!("shutdown signal received while idle, exiting");
                    return Ok(());
                }
            }
            continue;
        };

        let Some(processor) = dispatcher.get(job.job_type) else {
            error!(job_id = job.id, job_type = ?job.job_type, "no processor registered for job type");
            queue.fail(job.id, "no processor registered", false).await?;
            continue;
        };

        match processor.process(&job).await {
            Ok(ProcessOutcome::Completed(result)) => {
                queue.complete(job.id, result).await?;
            }
            Ok(ProcessOutcome::ScanFailed) => {
                queue.fail(job.id, "scan failed, see scan.error", false).await?;
            }
            Err(e) => {
                error!(job_id = job.id, job_type = ?job.job_type, error = %e, "phase processor failed");
                queue.fail(job.id, &e.to_string(), e.retryable()).await?;
            }
        }
    }
}
