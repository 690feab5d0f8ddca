use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Mutex;
use tracing::info;

use crate::ratelimit::{is_retryable_status, RateLimiter, RetryOutcome};

/// Non-retryable source-host failures a phase processor can distinguish from
/// a plain transient error by downcasting, per spec.md §4.3: "ingest...
/// surfaces only non-retryable auth/404 failures".
#[derive(Debug, thiserror::Error)]
pub enum SourceHostError {
    #[error("source host authentication failed: {0}")]
    Auth(String),
    #[error("source host resource not found: {0}")]
    NotFound(String),
}

fn bail_on_status(status: reqwest::StatusCode, body: String) -> anyhow::Error {
    match status.as_u16() {
        401 | 403 => SourceHostError::Auth(body).into(),
        404 => SourceHostError::NotFound(body).into(),
        _ => anyhow::anyhow!("source host returned {status}: {body}"),
    }
}

/// One open PR as listed by the source host, before ingest decides whether it
/// needs a fresh file-list/diff fetch. Cheap: produced entirely from the
/// paginated list endpoint, no per-PR request.
#[derive(Debug, Clone)]
pub struct RemotePr {
    pub number: i64,
    pub title: String,
    pub body: String,
    pub author: String,
    pub state: String,
    pub updated_at: DateTime<Utc>,
}

/// Client boundary over a tracked source-control repository's open pull
/// requests, behind a trait so a self-hosted forge can be swapped in without
/// touching the ingest phase.
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Lists all open PRs for a repo, paginating internally (`per_page=100`,
    /// stop on a short page per spec.md §6). Carries no diff/file-path data;
    /// ingest fetches those only for PRs it decides have actually changed.
    async fn list_open_prs(&self, owner: &str, repo: &str) -> Result<Vec<RemotePr>>;

    /// Fetches the file-path list for one PR (`GET .../pulls/:num/files`).
    async fn fetch_files(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<String>>;

    /// Fetches the raw unified diff for one PR
    /// (`GET .../pulls/:num` with `Accept: application/vnd.github.diff`).
    async fn fetch_diff(&self, owner: &str, repo: &str, number: i64) -> Result<String>;
}

pub struct GithubSourceHost {
    client: reqwest::Client,
    base_url: String,
    token: String,
    limiter: RateLimiter,
}

#[derive(Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Deserialize)]
struct GhPull {
    number: i64,
    title: String,
    body: Option<String>,
    user: GhUser,
    state: String,
    updated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct GhFile {
    filename: String,
}

impl GithubSourceHost {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, limiter: RateLimiter) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            limiter,
        }
    }

    async fn fetch_page(&self, owner: &str, repo: &str, page: u32) -> Result<RetryOutcome<Vec<GhPull>>> {
        let url = format!(
            "{}/repos/{owner}/{repo}/pulls?state=open&per_page=100&page={page}",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("User-Agent", "dupescan")
            .send()
            .await
            .context("source host request failed")?;

        let status = response.status();
        if is_retryable_status(status) {
            return Ok(RetryOutcome::Retry(format!("source host returned {status}")));
        }
        if !status.is_success() {
            return Err(bail_on_status(status, response.text().await.unwrap_or_default()));
        }

        let pulls: Vec<GhPull> = response.json().await.context("failed to parse source host response")?;
        Ok(RetryOutcome::Done(pulls))
    }

    async fn fetch_files_page(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        page: u32,
    ) -> Result<RetryOutcome<Vec<GhFile>>> {
        let url = format!(
            "{}/repos/{owner}/{repo}/pulls/{number}/files?per_page=100&page={page}",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("User-Agent", "dupescan")
            .send()
            .await
            .context("files request failed")?;

        let status = response.status();
        if is_retryable_status(status) {
            return Ok(RetryOutcome::Retry(format!("files fetch returned {status}")));
        }
        if !status.is_success() {
            return Err(bail_on_status(status, response.text().await.unwrap_or_default()));
        }
        Ok(RetryOutcome::Done(
            response.json().await.context("failed to parse files response")?,
        ))
    }

    async fn fetch_diff_once(&self, owner: &str, repo: &str, number: i64) -> Result<RetryOutcome<String>> {
        let url = format!(
            "{}/repos/{owner}/{repo}/pulls/{number}",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github.diff")
            .header("User-Agent", "dupescan")
            .send()
            .await
            .context("diff request failed")?;

        let status = response.status();
        if is_retryable_status(status) {
            return Ok(RetryOutcome::Retry(format!("diff fetch returned {status}")));
        }
        if !status.is_success() {
            return Err(bail_on_status(status, response.text().await.unwrap_or_default()));
        }
        Ok(RetryOutcome::Done(response.text().await.context("failed to read diff body")?))
    }
}

#[async_trait]
impl SourceHost for GithubSourceHost {
    async fn list_open_prs(&self, owner: &str, repo: &str) -> Result<Vec<RemotePr>> {
        let mut prs = Vec::new();
        let mut page = 1;
        loop {
            let owner_s = owner.to_string();
            let repo_s = repo.to_string();
            let gh_pulls = self
                .limiter
                .run(|_attempt| {
                    let owner_s = owner_s.clone();
                    let repo_s = repo_s.clone();
                    async move { self.fetch_page(&owner_s, &repo_s, page).await }
                })
                .await?;

            let short_page = gh_pulls.len() < 100;
            info!(owner, repo, page, count = gh_pulls.len(), "fetched source host page");

            for pull in gh_pulls {
                prs.push(RemotePr {
                    number: pull.number,
                    title: pull.title,
                    body: pull.body.unwrap_or_default(),
                    author: pull.user.login,
                    state: pull.state,
                    updated_at: pull.updated_at,
                });
            }

            if short_page {
                break;
            }
            page += 1;
        }
        Ok(prs)
    }

    async fn fetch_files(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut page = 1;
        loop {
            let owner = owner.to_string();
            let repo = repo.to_string();
            let gh_files = self
                .limiter
                .run(|_attempt| {
                    let owner = owner.clone();
                    let repo = repo.clone();
                    async move { self.fetch_files_page(&owner, &repo, number, page).await }
                })
                .await?;
            let short_page = gh_files.len() < 100;
            files.extend(gh_files.into_iter().map(|f| f.filename));
            if short_page {
                break;
            }
            page += 1;
        }
        Ok(files)
    }

    async fn fetch_diff(&self, owner: &str, repo: &str, number: i64) -> Result<String> {
        let owner = owner.to_string();
        let repo = repo.to_string();
        self.limiter
            .run(|_attempt| {
                let owner = owner.clone();
                let repo = repo.clone();
                async move { self.fetch_diff_once(&owner, &repo, number).await }
            })
            .await
    }
}

/// In-memory fake for tests, grounded in the same trait-object pattern the
/// teacher uses for its pluggable agent backends. Seeded with the full PR
/// record (diff + files) so tests can assert on what ingest does with them.
pub struct FakeSourceHost {
    prs: Mutex<Vec<FakeRemotePr>>,
}

#[derive(Debug, Clone)]
pub struct FakeRemotePr {
    pub summary: RemotePr,
    pub file_paths: Vec<String>,
    pub diff: String,
}

impl FakeSourceHost {
    pub fn new(prs: Vec<FakeRemotePr>) -> Self {
        Self {
            prs: Mutex::new(prs),
        }
    }
}

#[async_trait]
impl SourceHost for FakeSourceHost {
    async fn list_open_prs(&self, _owner: &str, _repo: &str) -> Result<Vec<RemotePr>> {
        Ok(self
            .prs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|p| p.summary.clone())
            .collect())
    }

    async fn fetch_files(&self, _owner: &str, _repo: &str, number: i64) -> Result<Vec<String>> {
        Ok(self
            .prs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| p.summary.number == number)
            .map(|p| p.file_paths.clone())
            .unwrap_or_default())
    }

    async fn fetch_diff(&self, _owner: &str, _repo: &str, number: i64) -> Result<String> {
        Ok(self
            .prs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| p.summary.number == number)
            .map(|p| p.diff.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(number: i64) -> FakeRemotePr {
        FakeRemotePr {
            summary: RemotePr {
                number,
                title: "fix bug".into(),
                body: "".into(),
                author: "alice".into(),
                state: "open".into(),
                updated_at: Utc::now(),
            },
            file_paths: vec!["src/a.rs".into()],
            diff: "diff --git a/src/a.rs b/src/a.rs\n".into(),
        }
    }

    #[tokio::test]
    async fn fake_returns_seeded_prs() {
        let fake = FakeSourceHost::new(vec![sample(1)]);
        let prs = fake.list_open_prs("o", "r").await.unwrap();
        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0].number, 1);
    }

    #[tokio::test]
    async fn fake_returns_files_and_diff_for_known_pr() {
        let fake = FakeSourceHost::new(vec![sample(7)]);
        assert_eq!(fake.fetch_files("o", "r", 7).await.unwrap(), vec!["src/a.rs".to_string()]);
        assert!(fake.fetch_diff("o", "r", 7).await.unwrap().contains("a/src/a.rs"));
    }

    #[tokio::test]
    async fn fake_returns_empty_for_unknown_pr() {
        let fake = FakeSourceHost::new(vec![sample(1)]);
        assert!(fake.fetch_files("o", "r", 999).await.unwrap().is_empty());
        assert_eq!(fake.fetch_diff("o", "r", 999).await.unwrap(), "");
    }
}
