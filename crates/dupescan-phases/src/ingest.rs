use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use dupescan_core::db::Db;
use dupescan_core::queue::JobQueue;
use dupescan_core::types::{EmbedJobPayload, IngestJobPayload, JobType, PrState, ScanStatus};
use dupescan_core::{Job, PhaseError, Pr};
use dupescan_providers::SourceHost;

use crate::processor::{PhaseProcessor, ProcessOutcome};
use crate::support::{classify_source_host_err, fail_scan, normalize_and_hash_diff};

const PAGE_SIZE: usize = 100;

/// Paginates open PRs from the source host, upserts by `(repoId, number)`,
/// computes `diffHash` only for PRs that are new or whose `updatedAt` moved
/// past what is stored, and marks PRs absent from the fetched open set as
/// `closed` (spec.md §4.3).
pub struct IngestProcessor {
    db: Arc<Db>,
    source_host: Arc<dyn SourceHost>,
    job_max_retries: i32,
    job_base_backoff_ms: u64,
}

impl IngestProcessor {
    pub fn new(
        db: Arc<Db>,
        source_host: Arc<dyn SourceHost>,
        job_max_retries: i32,
        job_base_backoff_ms: u64,
    ) -> Self {
        Self {
            db,
            source_host,
            job_max_retries,
            job_base_backoff_ms,
        }
    }
}

#[async_trait]
impl PhaseProcessor for IngestProcessor {
    fn job_type(&self) -> JobType {
        JobType::Ingest
    }

    async fn process(&self, job: &Job) -> Result<ProcessOutcome, PhaseError> {
        let payload: IngestJobPayload =
            serde_json::from_value(job.payload.clone()).map_err(PhaseError::data)?;
        let scan_id = payload.scan_id;

        match self.run(payload).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.retryable() => Err(e),
            Err(e) => fail_scan(&self.db, scan_id, &e).await,
        }
    }
}

impl IngestProcessor {
    async fn run(&self, payload: IngestJobPayload) -> Result<ProcessOutcome, PhaseError> {
        self.db
            .update_scan_status(payload.scan_id, ScanStatus::Ingesting, None)
            .await
            .map_err(PhaseError::transient)?;

        let scan = self
            .db
            .get_scan(payload.scan_id)
            .await
            .map_err(PhaseError::transient)?
            .ok_or_else(|| PhaseError::invariant(anyhow::anyhow!("scan {} vanished mid-ingest", payload.scan_id)))?;
        let resume_from_page: usize = scan
            .phase_cursor
            .get("page")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;

        let remote_prs = self
            .source_host
            .list_open_prs(&payload.owner, &payload.repo)
            .await
            .map_err(classify_source_host_err)?;

        let mut fetched_numbers = HashSet::new();
        for (page_idx, chunk) in remote_prs.chunks(PAGE_SIZE).enumerate() {
            if page_idx < resume_from_page {
                for remote in chunk {
                    fetched_numbers.insert(remote.number);
                }
                continue;
            }

            for remote in chunk {
                fetched_numbers.insert(remote.number);

                let stored = self
                    .db
                    .get_pr_by_number(payload.repo_id, remote.number)
                    .await
                    .map_err(PhaseError::transient)?;
                let changed = match &stored {
                    None => true,
                    Some(pr) => remote.updated_at > pr.updated_at,
                };

                let state = PrState::from_str(&remote.state).unwrap_or(PrState::Open);

                if !changed {
                    // Unchanged since the last scan: nothing new to fetch, but
                    // the stored row's title/body/author/state may still have
                    // drifted only within the same `updatedAt` tick (rare);
                    // keep the cheap path and trust the prior upsert.
                    continue;
                }

                // New PR, or its `updatedAt` moved past what is stored: fetch
                // the current file list and diff.
                let file_paths = self
                    .source_host
                    .fetch_files(&payload.owner, &payload.repo, remote.number)
                    .await
                    .map_err(classify_source_host_err)?;
                let diff = self
                    .source_host
                    .fetch_diff(&payload.owner, &payload.repo, remote.number)
                    .await
                    .map_err(classify_source_host_err)?;
                let diff_hash = Some(normalize_and_hash_diff(&diff));

                let pr = Pr {
                    id: 0,
                    repo_id: payload.repo_id,
                    number: remote.number,
                    title: remote.title.clone(),
                    body: remote.body.clone(),
                    author: remote.author.clone(),
                    diff_hash,
                    file_paths,
                    state,
                    github_etag: stored.as_ref().and_then(|p| p.github_etag.clone()),
                    created_at: chrono::Utc::now(),
                    updated_at: remote.updated_at,
                };
                self.db
                    .upsert_pr(&pr)
                    .await
                    .map_err(PhaseError::transient)?;
            }

            self.db
                .update_scan_phase_cursor(payload.scan_id, serde_json::json!({"page": page_idx + 1}))
                .await
                .map_err(PhaseError::transient)?;
        }

        let stored_open = self
            .db
            .list_open_prs_for_repo(payload.repo_id)
            .await
            .map_err(PhaseError::transient)?;
        for stale in stored_open.iter().filter(|pr| !fetched_numbers.contains(&pr.number)) {
            let mut closed = stale.clone();
            closed.state = PrState::Closed;
            self.db
                .upsert_pr(&closed)
                .await
                .map_err(PhaseError::transient)?;
            warn!(number = stale.number, repo_id = payload.repo_id, "PR no longer open upstream, marked closed");
        }

        let open_prs = self
            .db
            .list_open_prs_for_repo(payload.repo_id)
            .await
            .map_err(PhaseError::transient)?;
        self.db
            .set_scan_pr_count(payload.scan_id, open_prs.len() as i64)
            .await
            .map_err(PhaseError::transient)?;

        let queue = JobQueue::new(&self.db, self.job_base_backoff_ms);
        let embed_payload = EmbedJobPayload {
            repo_id: payload.repo_id,
            scan_id: payload.scan_id,
            account_id: payload.account_id,
            owner: payload.owner.clone(),
            repo: payload.repo.clone(),
        };
        queue
            .enqueue(
                JobType::Embed,
                serde_json::to_value(&embed_payload).map_err(PhaseError::data)?,
                Some(payload.scan_id),
                self.job_max_retries,
            )
            .await
            .map_err(PhaseError::transient)?;

        info!(scan_id = payload.scan_id, pr_count = open_prs.len(), "ingest complete");
        Ok(ProcessOutcome::Completed(
            serde_json::json!({"prCount": open_prs.len()}),
        ))
    }
}

// `IngestProcessor::process` needs a live `Db` (Postgres), so its behaviour is
// exercised end-to-end by the scenarios in spec.md §8 (S3, S6) rather than a
// unit test here; see DESIGN.md's "Known gaps" entry. The normalize/hash
// helpers it calls are unit-tested in `support.rs`.
