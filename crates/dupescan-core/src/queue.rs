use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::db::Db;
use crate::types::{Job, JobType};

/// Exponential backoff with jitter: `base * 2^(attempts-1)`, plus up to 20%
/// jitter so retries from a batch of jobs failing together don't all wake up
/// on the same tick.
pub fn backoff_delay(base_ms: u64, attempts: i32) -> Duration {
    let exp = attempts.max(1) - 1;
    let millis = base_ms.saturating_mul(1u64 << exp.min(20));
    let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..0.2);
    let jittered = (millis as f64) * (1.0 + jitter_frac);
    Duration::milliseconds(jittered as i64)
}

/// Wraps the persistent store's `jobs` table with claim/complete/fail/release
/// semantics. `claim` uses a single `FOR UPDATE SKIP LOCKED` CTE so multiple
/// workers polling concurrently never claim the same row twice.
pub struct JobQueue<'a> {
    db: &'a Db,
    base_backoff_ms: u64,
}

impl<'a> JobQueue<'a> {
    pub fn new(db: &'a Db, base_backoff_ms: u64) -> Self {
        Self {
            db,
            base_backoff_ms,
        }
    }

    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        scan_id: Option<i64>,
        max_retries: i32,
    ) -> Result<i64> {
        let client = self
            .db
            .pool()
            .get()
            .await
            .context("enqueue: acquire client")?;
        let row = client
            .query_one(
                "INSERT INTO jobs (job_type, payload, status, attempts, max_retries, \
                 run_after, scan_id) \
                 VALUES ($1, $2, 'queued', 0, $3, now(), $4) RETURNING id",
                &[&job_type.as_str(), &payload, &max_retries, &scan_id],
            )
            .await
            .context("enqueue")?;
        Ok(row.get("id"))
    }

    /// Claim at most one ready job of any of `job_types`. Returns `None` when
    /// the queue has nothing ready, signalling the worker loop to idle-sleep.
    pub async fn claim(&self, job_types: &[JobType]) -> Result<Option<Job>> {
        let client = self.db.pool().get().await.context("claim: acquire client")?;
        let type_strs: Vec<&str> = job_types.iter().map(|t| t.as_str()).collect();
        let row = client
            .query_opt(
                "WITH claimable AS ( \
                   SELECT id FROM jobs \
                   WHERE status = 'queued' AND job_type = ANY($1) AND run_after <= now() \
                   ORDER BY run_after ASC \
                   LIMIT 1 \
                   FOR UPDATE SKIP LOCKED \
                 ) \
                 UPDATE jobs SET status = 'running', attempts = attempts + 1, updated_at = now() \
                 WHERE id IN (SELECT id FROM claimable) \
                 RETURNING id, job_type, payload, status, result, error, attempts, \
                   max_retries, run_after, scan_id, created_at, updated_at",
                &[&type_strs],
            )
            .await
            .context("claim")?;
        Ok(row.as_ref().map(Db::row_to_job))
    }

    pub async fn complete(&self, id: i64, result: serde_json::Value) -> Result<()> {
        let client = self
            .db
            .pool()
            .get()
            .await
            .context("complete: acquire client")?;
        client
            .execute(
                "UPDATE jobs SET status = 'done', result = $1, updated_at = now() WHERE id = $2",
                &[&result, &id],
            )
            .await
            .context("complete")?;
        Ok(())
    }

    /// Record a failed attempt. Retryable failures within `max_retries` are
    /// released back to `queued` with exponential backoff; otherwise the job
    /// transitions to failed. The owning scan's `failed` transition is the
    /// calling processor's responsibility (see `support::fail_scan`), not
    /// this queue's — `phaseCursor`/`scan.status` ownership stays with the
    /// processor per spec.md §3.
    pub async fn fail(&self, id: i64, error: &str, retryable: bool) -> Result<()> {
        let client = self.db.pool().get().await.context("fail: acquire client")?;
        let job_row = client
            .query_one(
                "SELECT attempts, max_retries FROM jobs WHERE id = $1",
                &[&id],
            )
            .await
            .context("fail: load job")?;
        let attempts: i32 = job_row.get("attempts");
        let max_retries: i32 = job_row.get("max_retries");

        if retryable && attempts <= max_retries {
            let run_after: DateTime<Utc> = Utc::now() + backoff_delay(self.base_backoff_ms, attempts);
            client
                .execute(
                    "UPDATE jobs SET status = 'queued', run_after = $1, error = $2, \
                     updated_at = now() WHERE id = $3",
                    &[&run_after, &error, &id],
                )
                .await
                .context("fail: release for retry")?;
        } else {
            client
                .execute(
                    "UPDATE jobs SET status = 'failed', error = $1, updated_at = now() \
                     WHERE id = $2",
                    &[&error, &id],
                )
                .await
                .context("fail: mark failed")?;
        }
        Ok(())
    }

    /// Release a job back to `queued` without counting it as a failed
    /// attempt — used when a worker shuts down mid-job.
    pub async fn release(&self, id: i64, run_after: DateTime<Utc>) -> Result<()> {
        let client = self
            .db
            .pool()
            .get()
            .await
            .context("release: acquire client")?;
        client
            .execute(
                "UPDATE jobs SET status = 'queued', run_after = $1, updated_at = now() \
                 WHERE id = $2",
                &[&run_after, &id],
            )
            .await
            .context("release")?;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<Job>> {
        let client = self.db.pool().get().await.context("get: acquire client")?;
        let row = client
            .query_opt(
                "SELECT id, job_type, payload, status, result, error, attempts, \
                 max_retries, run_after, scan_id, created_at, updated_at \
                 FROM jobs WHERE id = $1",
                &[&id],
            )
            .await
            .context("get")?;
        Ok(row.as_ref().map(Db::row_to_job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_with_jitter_bounds() {
        let d1 = backoff_delay(1000, 1);
        let d2 = backoff_delay(1000, 2);
        let d3 = backoff_delay(1000, 3);

        assert!(d1.num_milliseconds() >= 1000 && d1.num_milliseconds() < 1200);
        assert!(d2.num_milliseconds() >= 2000 && d2.num_milliseconds() < 2400);
        assert!(d3.num_milliseconds() >= 4000 && d3.num_milliseconds() < 4800);
    }

    #[test]
    fn backoff_caps_exponent_to_avoid_overflow() {
        let d = backoff_delay(1000, 100);
        assert!(d.num_milliseconds() > 0);
    }
}
