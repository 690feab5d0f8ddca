use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use dupescan_core::db::Db;
use dupescan_core::queue::JobQueue;
use dupescan_core::types::{ClusterJobPayload, EmbedJobPayload, JobType, ScanConfig, ScanStatus};
use dupescan_core::vector::VectorStore;
use dupescan_core::{vector_point_key, Job, PhaseError};
use dupescan_providers::{ChatProvider, EmbeddingProvider, SourceHost};

use crate::processor::{PhaseProcessor, ProcessOutcome};
use crate::support::{classify_source_host_err, fail_scan, truncate_chars};

const INTENT_SUMMARY_SYSTEM: &str = "You summarise a pull request's intent in one or two \
    plain-language sentences, focused on *why* the change exists rather than its mechanics.";
const DIFF_EXCERPT_CHARS: usize = 20_000;

/// Embeds both a "code text" and an "intent text" per open PR into the
/// `code`/`intent` vector collections (spec.md §4.4).
pub struct EmbedProcessor {
    db: Arc<Db>,
    source_host: Arc<dyn SourceHost>,
    embedding: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatProvider>,
    vector_store: Arc<dyn VectorStore>,
    scan_config: ScanConfig,
    job_max_retries: i32,
    job_base_backoff_ms: u64,
}

impl EmbedProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Db>,
        source_host: Arc<dyn SourceHost>,
        embedding: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatProvider>,
        vector_store: Arc<dyn VectorStore>,
        scan_config: ScanConfig,
        job_max_retries: i32,
        job_base_backoff_ms: u64,
    ) -> Self {
        Self {
            db,
            source_host,
            embedding,
            chat,
            vector_store,
            scan_config,
            job_max_retries,
            job_base_backoff_ms,
        }
    }

    fn code_text(title: &str, file_paths: &[String], diff: &str) -> String {
        format!(
            "{title}\n{}\n{}",
            file_paths.join("\n"),
            truncate_chars(diff, DIFF_EXCERPT_CHARS)
        )
    }

    fn template_intent_text(title: &str, body: &str, file_paths: &[String]) -> String {
        format!(
            "This PR intends to: {title}. {}\nTouches: {}",
            truncate_chars(body, 2_000),
            file_paths.join(", ")
        )
    }
}

#[async_trait]
impl PhaseProcessor for EmbedProcessor {
    fn job_type(&self) -> JobType {
        JobType::Embed
    }

    async fn process(&self, job: &Job) -> Result<ProcessOutcome, PhaseError> {
        let payload: EmbedJobPayload =
            serde_json::from_value(job.payload.clone()).map_err(PhaseError::data)?;
        let scan_id = payload.scan_id;

        match self.run(payload).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.retryable() => Err(e),
            Err(e) => fail_scan(&self.db, scan_id, &e).await,
        }
    }
}

impl EmbedProcessor {
    async fn run(&self, payload: EmbedJobPayload) -> Result<ProcessOutcome, PhaseError> {
        self.db
            .update_scan_status(payload.scan_id, ScanStatus::Embedding, None)
            .await
            .map_err(PhaseError::transient)?;

        let scan = self
            .db
            .get_scan(payload.scan_id)
            .await
            .map_err(PhaseError::transient)?
            .ok_or_else(|| PhaseError::invariant(anyhow::anyhow!("scan {} vanished mid-embed", payload.scan_id)))?;
        let resume_after: i64 = scan
            .phase_cursor
            .get("lastPrNumber")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        let open_prs = self
            .db
            .list_open_prs_for_repo(payload.repo_id)
            .await
            .map_err(PhaseError::transient)?;
        let pending: Vec<_> = open_prs
            .into_iter()
            .filter(|pr| pr.number > resume_after)
            .collect();

        for batch in pending.chunks(self.scan_config.embed_batch_size.max(1)) {
            let mut code_texts = Vec::with_capacity(batch.len());
            let mut intent_texts = Vec::with_capacity(batch.len());

            for pr in batch {
                let diff = self
                    .source_host
                    .fetch_diff(&payload.owner, &payload.repo, pr.number)
                    .await
                    .map_err(classify_source_host_err)?;
                code_texts.push(Self::code_text(&pr.title, &pr.file_paths, &diff));

                let intent_text = if self.scan_config.intent_summary_via_llm {
                    let user_prompt = format!(
                        "Title: {}\nBody: {}\nFiles: {}",
                        pr.title,
                        truncate_chars(&pr.body, 4_000),
                        pr.file_paths.join(", ")
                    );
                    let response = self
                        .chat
                        .complete(INTENT_SUMMARY_SYSTEM, &user_prompt)
                        .await
                        .map_err(PhaseError::transient)?;
                    self.db
                        .add_token_usage(payload.scan_id, 0, response.input_tokens, response.output_tokens)
                        .await
                        .map_err(PhaseError::transient)?;
                    response.content
                } else {
                    Self::template_intent_text(&pr.title, &pr.body, &pr.file_paths)
                };
                intent_texts.push(intent_text);
            }

            let (code_vectors, code_tokens) = self
                .embedding
                .embed_batch(&code_texts)
                .await
                .map_err(PhaseError::transient)?;
            let (intent_vectors, intent_tokens) = self
                .embedding
                .embed_batch(&intent_texts)
                .await
                .map_err(PhaseError::transient)?;
            self.db
                .add_token_usage(payload.scan_id, code_tokens + intent_tokens, 0, 0)
                .await
                .map_err(PhaseError::transient)?;

            for ((pr, code_vec), intent_vec) in batch.iter().zip(code_vectors).zip(intent_vectors) {
                let mut code_payload = std::collections::HashMap::new();
                code_payload.insert("repo_id".to_string(), serde_json::json!(payload.repo_id));
                code_payload.insert("pr_number".to_string(), serde_json::json!(pr.number));
                self.vector_store
                    .upsert(
                        &self.scan_config.code_collection,
                        &vector_point_key(payload.repo_id, pr.number, "code"),
                        code_vec,
                        code_payload.clone(),
                    )
                    .await
                    .map_err(PhaseError::transient)?;
                self.vector_store
                    .upsert(
                        &self.scan_config.intent_collection,
                        &vector_point_key(payload.repo_id, pr.number, "intent"),
                        intent_vec,
                        code_payload,
                    )
                    .await
                    .map_err(PhaseError::transient)?;
            }

            if let Some(last) = batch.last() {
                self.db
                    .update_scan_phase_cursor(
                        payload.scan_id,
                        serde_json::json!({"lastPrNumber": last.number}),
                    )
                    .await
                    .map_err(PhaseError::transient)?;
            }
        }

        let queue = JobQueue::new(&self.db, self.job_base_backoff_ms);
        let cluster_payload = ClusterJobPayload {
            repo_id: payload.repo_id,
            scan_id: payload.scan_id,
            account_id: payload.account_id,
            owner: payload.owner.clone(),
            repo: payload.repo.clone(),
        };
        queue
            .enqueue(
                JobType::Cluster,
                serde_json::to_value(&cluster_payload).map_err(PhaseError::data)?,
                Some(payload.scan_id),
                self.job_max_retries,
            )
            .await
            .map_err(PhaseError::transient)?;

        info!(scan_id = payload.scan_id, embedded = pending.len(), "embed complete");
        Ok(ProcessOutcome::Completed(
            serde_json::json!({"embedded": pending.len()}),
        ))
    }
}
