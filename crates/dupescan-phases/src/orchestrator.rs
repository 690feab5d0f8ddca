use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use dupescan_core::db::Db;
use dupescan_core::queue::JobQueue;
use dupescan_core::types::{IngestJobPayload, JobType, ScanJobPayload, ScanStatus};
use dupescan_core::{Job, PhaseError};

use crate::processor::{PhaseProcessor, ProcessOutcome};
use crate::support::fail_scan;

/// The `scan`-typed job (spec.md §2 component 6): its sole job is to enqueue
/// `ingest` with the payload ingest needs. Everything else about the scan's
/// lifecycle belongs to the five phase processors.
pub struct ScanOrchestrator {
    db: Arc<Db>,
    job_max_retries: i32,
    job_base_backoff_ms: u64,
}

impl ScanOrchestrator {
    pub fn new(db: Arc<Db>, job_max_retries: i32, job_base_backoff_ms: u64) -> Self {
        Self {
            db,
            job_max_retries,
            job_base_backoff_ms,
        }
    }
}

#[async_trait]
impl PhaseProcessor for ScanOrchestrator {
    fn job_type(&self) -> JobType {
        JobType::Scan
    }

    async fn process(&self, job: &Job) -> Result<ProcessOutcome, PhaseError> {
        let payload: ScanJobPayload =
            serde_json::from_value(job.payload.clone()).map_err(PhaseError::data)?;

        let repo = self
            .db
            .get_repo(payload.repo_id)
            .await
            .map_err(PhaseError::transient)?;
        let Some(repo) = repo else {
            return fail_scan(
                &self.db,
                payload.scan_id,
                &PhaseError::invariant(anyhow::anyhow!(
                    "scan {} references repo {} which does not exist",
                    payload.scan_id,
                    payload.repo_id
                )),
            )
            .await;
        };

        self.db
            .update_scan_status(payload.scan_id, ScanStatus::Ingesting, None)
            .await
            .map_err(PhaseError::transient)?;

        let queue = JobQueue::new(&self.db, self.job_base_backoff_ms);
        let ingest_payload = IngestJobPayload {
            repo_id: payload.repo_id,
            scan_id: payload.scan_id,
            account_id: payload.account_id,
            owner: repo.owner.clone(),
            repo: repo.name.clone(),
        };
        queue
            .enqueue(
                JobType::Ingest,
                serde_json::to_value(&ingest_payload).map_err(PhaseError::data)?,
                Some(payload.scan_id),
                self.job_max_retries,
            )
            .await
            .map_err(PhaseError::transient)?;

        info!(scan_id = payload.scan_id, repo_id = payload.repo_id, "scan started, ingest enqueued");
        Ok(ProcessOutcome::Completed(serde_json::json!({"enqueued": "ingest"})))
    }
}
