use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use dupescan_core::db::Db;
use dupescan_core::types::{JobType, RankJobPayload, ScanStatus, VerifiedGroup};
use dupescan_core::{Job, PhaseError, Pr};
use dupescan_providers::{ChatProvider, SourceHost};

use crate::processor::{PhaseProcessor, ProcessOutcome};
use crate::support::{classify_source_host_err, fail_scan, parse_json_response, truncate_chars};

const RANK_SYSTEM: &str = "You rank pull requests within a confirmed duplicate group to decide \
    which one a maintainer should keep. Score each PR from 0 to 100 on code quality and \
    completeness, with a one-sentence rationale. Respond with strict JSON only: \
    {\"rankings\": [{\"prNumber\": number, \"score\": number, \"codeQuality\": number, \
    \"completeness\": number, \"rationale\": string}]}.";
const DIFF_EXCERPT_CHARS: usize = 4_000;

#[derive(Debug, Deserialize)]
struct RankEntry {
    #[serde(rename = "prNumber")]
    pr_number: i64,
    score: f64,
    rationale: String,
}

#[derive(Debug, Deserialize)]
struct RankResponse {
    rankings: Vec<RankEntry>,
}

/// Sends one LLM call per verified group asking for a ranking, then persists
/// one `DupeGroup`/`DupeGroupMember` row set per group (spec.md §4.7). The
/// terminal phase: sets `scan.status = done` and enqueues no successor.
pub struct RankProcessor {
    db: Arc<Db>,
    source_host: Arc<dyn SourceHost>,
    chat: Arc<dyn ChatProvider>,
}

impl RankProcessor {
    pub fn new(db: Arc<Db>, source_host: Arc<dyn SourceHost>, chat: Arc<dyn ChatProvider>) -> Self {
        Self { db, source_host, chat }
    }

    async fn describe_pr(&self, owner: &str, repo: &str, pr: &Pr) -> Result<String, PhaseError> {
        let diff = self
            .source_host
            .fetch_diff(owner, repo, pr.number)
            .await
            .map_err(classify_source_host_err)?;
        Ok(format!(
            "PR #{}: {}\nBody: {}\nFiles: {}\nDiff excerpt:\n{}",
            pr.number,
            pr.title,
            truncate_chars(&pr.body, 1_000),
            pr.file_paths.join(", "),
            truncate_chars(&diff, DIFF_EXCERPT_CHARS)
        ))
    }

    async fn rank_group(
        &self,
        payload: &RankJobPayload,
        group: &VerifiedGroup,
    ) -> Result<(), PhaseError> {
        if group.pr_ids.len() < 2 {
            return Err(PhaseError::invariant(anyhow::anyhow!(
                "verified group with fewer than 2 members reached rank"
            )));
        }

        let mut prs = Vec::with_capacity(group.pr_ids.len());
        for &pr_id in &group.pr_ids {
            let pr = self
                .db
                .get_pr(pr_id)
                .await
                .map_err(PhaseError::transient)?
                .ok_or_else(|| PhaseError::data(anyhow::anyhow!("PR {pr_id} referenced by verified group does not exist")))?;
            prs.push(pr);
        }

        let mut descriptions = Vec::with_capacity(prs.len());
        for pr in &prs {
            descriptions.push(self.describe_pr(&payload.owner, &payload.repo, pr).await?);
        }
        let user_prompt = format!(
            "Duplicate group ({}):\n\n{}",
            group.relationship,
            descriptions.join("\n\n---\n\n")
        );

        let mut parsed = None;
        for attempt in 0..2 {
            let response = self
                .chat
                .complete(RANK_SYSTEM, &user_prompt)
                .await
                .map_err(PhaseError::transient)?;
            self.db
                .add_token_usage(payload.scan_id, 0, response.input_tokens, response.output_tokens)
                .await
                .map_err(PhaseError::transient)?;
            match parse_json_response::<RankResponse>(&response.content) {
                Ok(r) => {
                    parsed = Some(r);
                    break;
                }
                Err(e) if attempt == 0 => {
                    tracing::warn!(error = %e, "rank response failed to parse, retrying once");
                }
                Err(e) => return Err(PhaseError::data(e)),
            }
        }
        let mut rankings = parsed
            .ok_or_else(|| PhaseError::data(anyhow::anyhow!("rank response never parsed")))?
            .rankings;
        rankings.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut members = Vec::with_capacity(rankings.len());
        for (idx, entry) in rankings.iter().enumerate() {
            let Some(pr) = prs.iter().find(|p| p.number == entry.pr_number) else {
                continue;
            };
            members.push((pr.id, (idx + 1) as i64, entry.score, entry.rationale.clone()));
        }
        if members.is_empty() {
            return Err(PhaseError::data(anyhow::anyhow!(
                "rank response referenced no PRs from the verified group"
            )));
        }

        self.db
            .insert_dupe_group(payload.scan_id, payload.repo_id, &group.label, &members)
            .await
            .map_err(PhaseError::transient)?;
        Ok(())
    }
}

#[async_trait]
impl PhaseProcessor for RankProcessor {
    fn job_type(&self) -> JobType {
        JobType::Rank
    }

    async fn process(&self, job: &Job) -> Result<ProcessOutcome, PhaseError> {
        let payload: RankJobPayload =
            serde_json::from_value(job.payload.clone()).map_err(PhaseError::data)?;

        self.db
            .update_scan_status(payload.scan_id, ScanStatus::Ranking, None)
            .await
            .map_err(PhaseError::transient)?;

        let groups: Vec<&VerifiedGroup> = payload
            .verified_groups
            .iter()
            .filter(|g| g.pr_ids.len() >= 2)
            .collect();

        for group in &groups {
            if let Err(e) = self.rank_group(&payload, group).await {
                if e.retryable() {
                    return Err(e);
                }
                return fail_scan(&self.db, payload.scan_id, &e).await;
            }
        }

        self.db
            .update_scan_status(payload.scan_id, ScanStatus::Done, None)
            .await
            .map_err(PhaseError::transient)?;
        self.db
            .mark_repo_scanned(payload.repo_id)
            .await
            .map_err(PhaseError::transient)?;

        info!(scan_id = payload.scan_id, groups = groups.len(), "rank complete, scan done");
        Ok(ProcessOutcome::Completed(
            serde_json::json!({"dupeGroupCount": groups.len()}),
        ))
    }
}
