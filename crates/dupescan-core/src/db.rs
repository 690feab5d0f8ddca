use anyhow::{Context, Result};
use chrono::Utc;
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use tokio_postgres::{NoTls, Row};

use crate::types::{
    DupeGroup, DupeGroupMember, Job, JobStatus, JobType, Pr, PrState, Repo, Scan, ScanStatus,
    TokenUsage,
};

const SCHEMA_SQL: &str = include_str!("../schema.sql");

pub struct Db {
    pool: Pool,
}

fn row_to_repo(row: &Row) -> Repo {
    Repo {
        id: row.get("id"),
        owner: row.get("owner"),
        name: row.get("name"),
        last_scan_at: row.get("last_scan_at"),
        created_at: row.get("created_at"),
    }
}

fn row_to_pr(row: &Row) -> Pr {
    let state: String = row.get("state");
    Pr {
        id: row.get("id"),
        repo_id: row.get("repo_id"),
        number: row.get("number"),
        title: row.get("title"),
        body: row.get("body"),
        author: row.get("author"),
        diff_hash: row.get("diff_hash"),
        file_paths: row.get("file_paths"),
        state: PrState::from_str(&state).unwrap_or(PrState::Open),
        github_etag: row.get("github_etag"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_scan(row: &Row) -> Scan {
    let status: String = row.get("status");
    let token_usage: serde_json::Value = row.get("token_usage");
    Scan {
        id: row.get("id"),
        repo_id: row.get("repo_id"),
        status: ScanStatus::from_str(&status).unwrap_or(ScanStatus::Queued),
        phase_cursor: row.get("phase_cursor"),
        pr_count: row.get("pr_count"),
        dupe_group_count: row.get("dupe_group_count"),
        token_usage: serde_json::from_value(token_usage).unwrap_or(TokenUsage::default()),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error: row.get("error"),
        created_at: row.get("created_at"),
    }
}

fn row_to_dupe_group(row: &Row) -> DupeGroup {
    DupeGroup {
        id: row.get("id"),
        scan_id: row.get("scan_id"),
        repo_id: row.get("repo_id"),
        label: row.get("label"),
        pr_count: row.get("pr_count"),
    }
}

fn row_to_dupe_group_member(row: &Row) -> DupeGroupMember {
    DupeGroupMember {
        id: row.get("id"),
        group_id: row.get("group_id"),
        pr_id: row.get("pr_id"),
        rank: row.get("rank"),
        score: row.get("score"),
        rationale: row.get("rationale"),
    }
}

fn row_to_job(row: &Row) -> Job {
    let job_type: String = row.get("job_type");
    let status: String = row.get("status");
    Job {
        id: row.get("id"),
        job_type: JobType::from_str(&job_type).unwrap_or(JobType::Ingest),
        payload: row.get("payload"),
        status: JobStatus::from_str(&status).unwrap_or(JobStatus::Queued),
        result: row.get("result"),
        error: row.get("error"),
        attempts: row.get("attempts"),
        max_retries: row.get("max_retries"),
        run_after: row.get("run_after"),
        scan_id: row.get("scan_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl Db {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let mut cfg = PoolConfig::new();
        cfg.url = Some(database_url.to_string());
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("failed to create postgres connection pool")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        let client = self.pool.get().await.context("migrate: acquire client")?;
        client
            .batch_execute(SCHEMA_SQL)
            .await
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Repos ────────────────────────────────────────────────────────────

    pub async fn upsert_repo(&self, owner: &str, name: &str) -> Result<Repo> {
        let client = self.pool.get().await.context("upsert_repo: acquire client")?;
        let row = client
            .query_one(
                "INSERT INTO repos (owner, name) VALUES ($1, $2) \
                 ON CONFLICT (owner, name) DO UPDATE SET owner = EXCLUDED.owner \
                 RETURNING id, owner, name, last_scan_at, created_at",
                &[&owner, &name],
            )
            .await
            .context("upsert_repo")?;
        Ok(row_to_repo(&row))
    }

    pub async fn get_repo(&self, id: i64) -> Result<Option<Repo>> {
        let client = self.pool.get().await.context("get_repo: acquire client")?;
        let row = client
            .query_opt(
                "SELECT id, owner, name, last_scan_at, created_at FROM repos WHERE id = $1",
                &[&id],
            )
            .await
            .context("get_repo")?;
        Ok(row.as_ref().map(row_to_repo))
    }

    pub async fn mark_repo_scanned(&self, id: i64) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("mark_repo_scanned: acquire client")?;
        client
            .execute(
                "UPDATE repos SET last_scan_at = now() WHERE id = $1",
                &[&id],
            )
            .await
            .context("mark_repo_scanned")?;
        Ok(())
    }

    // ── Pull requests ────────────────────────────────────────────────────

    /// Insert or refresh a PR. Unique on `(repo_id, number)` per spec.md §3.
    /// `pr.updated_at` is stored verbatim (not `now()`) since ingest compares
    /// it against the source host's own `updatedAt` on the next scan to
    /// decide whether a PR needs a fresh file-list/diff fetch.
    pub async fn upsert_pr(&self, pr: &Pr) -> Result<Pr> {
        let client = self.pool.get().await.context("upsert_pr: acquire client")?;
        let row = client
            .query_one(
                "INSERT INTO prs (repo_id, number, title, body, author, diff_hash, \
                 file_paths, state, github_etag, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (repo_id, number) DO UPDATE SET \
                   title = EXCLUDED.title, body = EXCLUDED.body, author = EXCLUDED.author, \
                   diff_hash = EXCLUDED.diff_hash, file_paths = EXCLUDED.file_paths, \
                   state = EXCLUDED.state, github_etag = EXCLUDED.github_etag, \
                   updated_at = EXCLUDED.updated_at \
                 RETURNING id, repo_id, number, title, body, author, diff_hash, \
                   file_paths, state, github_etag, created_at, updated_at",
                &[
                    &pr.repo_id,
                    &pr.number,
                    &pr.title,
                    &pr.body,
                    &pr.author,
                    &pr.diff_hash,
                    &pr.file_paths,
                    &pr.state.as_str(),
                    &pr.github_etag,
                    &pr.updated_at,
                ],
            )
            .await
            .context("upsert_pr")?;
        Ok(row_to_pr(&row))
    }

    pub async fn get_pr(&self, id: i64) -> Result<Option<Pr>> {
        let client = self.pool.get().await.context("get_pr: acquire client")?;
        let row = client
            .query_opt(
                "SELECT id, repo_id, number, title, body, author, diff_hash, file_paths, \
                 state, github_etag, created_at, updated_at FROM prs WHERE id = $1",
                &[&id],
            )
            .await
            .context("get_pr")?;
        Ok(row.as_ref().map(row_to_pr))
    }

    pub async fn get_pr_by_number(&self, repo_id: i64, number: i64) -> Result<Option<Pr>> {
        let client = self
            .pool
            .get()
            .await
            .context("get_pr_by_number: acquire client")?;
        let row = client
            .query_opt(
                "SELECT id, repo_id, number, title, body, author, diff_hash, file_paths, \
                 state, github_etag, created_at, updated_at FROM prs \
                 WHERE repo_id = $1 AND number = $2",
                &[&repo_id, &number],
            )
            .await
            .context("get_pr_by_number")?;
        Ok(row.as_ref().map(row_to_pr))
    }

    pub async fn list_open_prs_for_repo(&self, repo_id: i64) -> Result<Vec<Pr>> {
        let client = self
            .pool
            .get()
            .await
            .context("list_open_prs_for_repo: acquire client")?;
        let rows = client
            .query(
                "SELECT id, repo_id, number, title, body, author, diff_hash, file_paths, \
                 state, github_etag, created_at, updated_at FROM prs \
                 WHERE repo_id = $1 AND state = 'open' ORDER BY number ASC",
                &[&repo_id],
            )
            .await
            .context("list_open_prs_for_repo")?;
        Ok(rows.iter().map(row_to_pr).collect())
    }

    // ── Scans (§6 control-surface contract) ──────────────────────────────

    /// Creates a new `queued` scan for `repo_id`. Fails with a descriptive
    /// error (rather than a raw constraint-violation message) when the repo
    /// already has a non-terminal scan in flight — spec.md §5's "at most one
    /// active scan per repo" rule, enforced by `idx_scans_one_active_per_repo`.
    pub async fn create_scan(&self, repo_id: i64) -> Result<Scan> {
        let client = self
            .pool
            .get()
            .await
            .context("create_scan: acquire client")?;
        let row = client
            .query_one(
                "INSERT INTO scans (repo_id, status, phase_cursor, token_usage) \
                 VALUES ($1, 'queued', '{}'::jsonb, '{}'::jsonb) \
                 RETURNING id, repo_id, status, phase_cursor, pr_count, dupe_group_count, \
                   token_usage, started_at, completed_at, error, created_at",
                &[&repo_id],
            )
            .await
            .map_err(|e| {
                if e.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) {
                    anyhow::anyhow!("repo {repo_id} already has an active scan in progress")
                } else {
                    anyhow::Error::new(e).context("create_scan")
                }
            })?;
        Ok(row_to_scan(&row))
    }

    pub async fn get_scan(&self, id: i64) -> Result<Option<Scan>> {
        let client = self.pool.get().await.context("get_scan: acquire client")?;
        let row = client
            .query_opt(
                "SELECT id, repo_id, status, phase_cursor, pr_count, dupe_group_count, \
                 token_usage, started_at, completed_at, error, created_at \
                 FROM scans WHERE id = $1",
                &[&id],
            )
            .await
            .context("get_scan")?;
        Ok(row.as_ref().map(row_to_scan))
    }

    pub async fn update_scan_status(
        &self,
        id: i64,
        status: ScanStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("update_scan_status: acquire client")?;
        let started_at = matches!(status, ScanStatus::Ingesting).then(Utc::now);
        let completed_at = status.is_terminal().then(Utc::now);
        client
            .execute(
                "UPDATE scans SET status = $1, error = COALESCE($2, error), \
                 started_at = COALESCE(started_at, $3), completed_at = COALESCE($4, completed_at) \
                 WHERE id = $5",
                &[&status.as_str(), &error, &started_at, &completed_at, &id],
            )
            .await
            .context("update_scan_status")?;
        Ok(())
    }

    pub async fn update_scan_phase_cursor(&self, id: i64, cursor: serde_json::Value) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("update_scan_phase_cursor: acquire client")?;
        client
            .execute(
                "UPDATE scans SET phase_cursor = $1 WHERE id = $2",
                &[&cursor, &id],
            )
            .await
            .context("update_scan_phase_cursor")?;
        Ok(())
    }

    pub async fn add_token_usage(
        &self,
        id: i64,
        embed_input: i64,
        chat_input: i64,
        chat_output: i64,
    ) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("add_token_usage: acquire client")?;
        client
            .execute(
                "UPDATE scans SET token_usage = jsonb_build_object( \
                   'embedInputTokens', COALESCE((token_usage->>'embedInputTokens')::bigint, 0) + $2, \
                   'chatInputTokens', COALESCE((token_usage->>'chatInputTokens')::bigint, 0) + $3, \
                   'chatOutputTokens', COALESCE((token_usage->>'chatOutputTokens')::bigint, 0) + $4) \
                 WHERE id = $1",
                &[&id, &embed_input, &chat_input, &chat_output],
            )
            .await
            .context("add_token_usage")?;
        Ok(())
    }

    pub async fn set_scan_pr_count(&self, id: i64, pr_count: i64) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("set_scan_pr_count: acquire client")?;
        client
            .execute(
                "UPDATE scans SET pr_count = $1 WHERE id = $2",
                &[&pr_count, &id],
            )
            .await
            .context("set_scan_pr_count")?;
        Ok(())
    }

    // ── Dupe groups (§6 control-surface contract) ────────────────────────

    pub async fn insert_dupe_group(
        &self,
        scan_id: i64,
        repo_id: i64,
        label: &str,
        members: &[(i64, i64, f64, String)],
    ) -> Result<DupeGroup> {
        let mut client = self
            .pool
            .get()
            .await
            .context("insert_dupe_group: acquire client")?;
        let tx = client
            .transaction()
            .await
            .context("insert_dupe_group: begin transaction")?;

        let group_row = tx
            .query_one(
                "INSERT INTO dupe_groups (scan_id, repo_id, label, pr_count) \
                 VALUES ($1, $2, $3, $4) RETURNING id, scan_id, repo_id, label, pr_count",
                &[&scan_id, &repo_id, &label, &(members.len() as i64)],
            )
            .await
            .context("insert_dupe_group: insert group")?;
        let group = row_to_dupe_group(&group_row);

        for (pr_id, rank, score, rationale) in members {
            tx.execute(
                "INSERT INTO dupe_group_members (group_id, pr_id, rank, score, rationale) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[&group.id, pr_id, rank, score, rationale],
            )
            .await
            .context("insert_dupe_group: insert member")?;
        }

        tx.execute(
            "UPDATE scans SET dupe_group_count = dupe_group_count + 1 WHERE id = $1",
            &[&scan_id],
        )
        .await
        .context("insert_dupe_group: bump scan dupe_group_count")?;

        tx.commit()
            .await
            .context("insert_dupe_group: commit transaction")?;
        Ok(group)
    }

    pub async fn list_dupe_groups_for_scan(&self, scan_id: i64) -> Result<Vec<DupeGroup>> {
        let client = self
            .pool
            .get()
            .await
            .context("list_dupe_groups_for_scan: acquire client")?;
        let rows = client
            .query(
                "SELECT id, scan_id, repo_id, label, pr_count FROM dupe_groups \
                 WHERE scan_id = $1 ORDER BY id ASC",
                &[&scan_id],
            )
            .await
            .context("list_dupe_groups_for_scan")?;
        Ok(rows.iter().map(row_to_dupe_group).collect())
    }

    pub async fn list_dupe_group_members(&self, group_id: i64) -> Result<Vec<DupeGroupMember>> {
        let client = self
            .pool
            .get()
            .await
            .context("list_dupe_group_members: acquire client")?;
        let rows = client
            .query(
                "SELECT id, group_id, pr_id, rank, score, rationale FROM dupe_group_members \
                 WHERE group_id = $1 ORDER BY rank ASC",
                &[&group_id],
            )
            .await
            .context("list_dupe_group_members")?;
        Ok(rows.iter().map(row_to_dupe_group_member).collect())
    }

    // ── Jobs (used by JobQueue, see queue.rs) ─────────────────────────────

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    pub(crate) fn row_to_job(row: &Row) -> Job {
        row_to_job(row)
    }
}
