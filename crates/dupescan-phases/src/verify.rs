use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::info;

use dupescan_core::db::Db;
use dupescan_core::queue::JobQueue;
use dupescan_core::types::{CandidateGroup, JobType, RankJobPayload, ScanConfig, ScanStatus, VerifiedGroup, VerifyJobPayload};
use dupescan_core::{Job, PhaseError, Pr};
use dupescan_providers::{ChatProvider, SourceHost};

use crate::processor::{PhaseProcessor, ProcessOutcome};
use crate::support::{classify_source_host_err, fail_scan, parse_json_response, truncate_chars};

const VERIFY_SYSTEM: &str = "You compare two pull requests against the same repository and \
    decide whether they propose substantially the same change or address the same underlying \
    intent. Respond with strict JSON only: {\"isDuplicate\": bool, \"confidence\": number between \
    0 and 1, \"relationship\": short string describing the relationship}.";
const DIFF_EXCERPT_CHARS: usize = 4_000;

#[derive(Debug, Deserialize)]
struct PairVerdict {
    is_duplicate: bool,
    confidence: f64,
    relationship: String,
}

/// Pairwise LLM verification over each candidate group's PRs, followed by
/// confidence-ordered greedy clique construction over the confirmed-edge
/// subgraph (spec.md §4.6). Deliberately *not* transitive closure: the LLM
/// is a noisy oracle on pairs, so every clique member must be individually
/// confirmed against every other member.
pub struct VerifyProcessor {
    db: Arc<Db>,
    source_host: Arc<dyn SourceHost>,
    chat: Arc<dyn ChatProvider>,
    scan_config: ScanConfig,
    job_max_retries: i32,
    job_base_backoff_ms: u64,
}

impl VerifyProcessor {
    pub fn new(
        db: Arc<Db>,
        source_host: Arc<dyn SourceHost>,
        chat: Arc<dyn ChatProvider>,
        scan_config: ScanConfig,
        job_max_retries: i32,
        job_base_backoff_ms: u64,
    ) -> Self {
        Self {
            db,
            source_host,
            chat,
            scan_config,
            job_max_retries,
            job_base_backoff_ms,
        }
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

    /// Calls the chat provider for one pair, parsing its JSON verdict. A
    /// parse failure is retried once inline (spec.md §7 "Data" errors are
    /// retried once, then fatal) before surfacing as a data error.
    async fn verify_pair(
        &self,
        scan_id: i64,
        description_a: &str,
        description_b: &str,
    ) -> Result<PairVerdict, PhaseError> {
        let user_prompt = format!(
            "First PR:\n{description_a}\n\nSecond PR:\n{description_b}\n\nAre these duplicates?"
        );
        for attempt in 0..2 {
            let response = self
                .chat
                .complete(VERIFY_SYSTEM, &user_prompt)
                .await
                .map_err(PhaseError::transient)?;
            self.db
                .add_token_usage(scan_id, 0, response.input_tokens, response.output_tokens)
                .await
                .map_err(PhaseError::transient)?;
            match parse_json_response::<PairVerdict>(&response.content) {
                Ok(verdict) => return Ok(verdict),
                Err(e) if attempt == 0 => {
                    tracing::warn!(error = %e, "pairwise verdict failed to parse, retrying once");
                    continue;
                }
                Err(e) => return Err(PhaseError::data(e)),
            }
        }
        unreachable!()
    }
}

#[async_trait]
impl PhaseProcessor for VerifyProcessor {
    fn job_type(&self) -> JobType {
        JobType::Verify
    }

    async fn process(&self, job: &Job) -> Result<ProcessOutcome, PhaseError> {
        let payload: VerifyJobPayload =
            serde_json::from_value(job.payload.clone()).map_err(PhaseError::data)?;

        self.db
            .update_scan_status(payload.scan_id, ScanStatus::Verifying, None)
            .await
            .map_err(PhaseError::transient)?;

        let mut verified_groups = Vec::new();

        for group in &payload.candidate_groups {
            match self.verify_candidate_group(&payload, group).await {
                Ok(mut groups) => verified_groups.append(&mut groups),
                Err(e) if e.retryable() => return Err(e),
                Err(e) => return fail_scan(&self.db, payload.scan_id, &e).await,
            }
        }

        self.db
            .update_scan_phase_cursor(
                payload.scan_id,
                serde_json::json!({"verifiedGroups": verified_groups}),
            )
            .await
            .map_err(PhaseError::transient)?;

        let queue = JobQueue::new(&self.db, self.job_base_backoff_ms);
        let rank_payload = RankJobPayload {
            repo_id: payload.repo_id,
            scan_id: payload.scan_id,
            owner: payload.owner.clone(),
            repo: payload.repo.clone(),
            verified_groups: verified_groups.clone(),
        };
        queue
            .enqueue(
                JobType::Rank,
                serde_json::to_value(&rank_payload).map_err(PhaseError::data)?,
                Some(payload.scan_id),
                self.job_max_retries,
            )
            .await
            .map_err(PhaseError::transient)?;

        info!(scan_id = payload.scan_id, groups = verified_groups.len(), "verify complete");
        Ok(ProcessOutcome::Completed(
            serde_json::json!({"verifiedGroups": verified_groups.len()}),
        ))
    }
}

impl VerifyProcessor {
    async fn verify_candidate_group(
        &self,
        payload: &VerifyJobPayload,
        group: &CandidateGroup,
    ) -> Result<Vec<VerifiedGroup>, PhaseError> {
        if group.pr_ids.len() < 2 {
            return Err(PhaseError::invariant(anyhow::anyhow!(
                "candidate group with fewer than 2 members reached verify"
            )));
        }

        let mut prs = Vec::with_capacity(group.pr_ids.len());
        for &pr_id in &group.pr_ids {
            let pr = self
                .db
                .get_pr(pr_id)
                .await
                .map_err(PhaseError::transient)?
                .ok_or_else(|| PhaseError::data(anyhow::anyhow!("PR {pr_id} referenced by candidate group does not exist")))?;
            prs.push(pr);
        }

        let mut descriptions = Vec::with_capacity(prs.len());
        for pr in &prs {
            descriptions.push(self.describe_pr(&payload.owner, &payload.repo, pr).await?);
        }

        let pairs: Vec<(usize, usize)> = (0..prs.len())
            .flat_map(|a| ((a + 1)..prs.len()).map(move |b| (a, b)))
            .collect();

        // Pairwise calls within this group run concurrently, bounded by
        // scanConfig.concurrency; calls across groups may overlap too since
        // each candidate group is processed by a fresh call to this method.
        let scan_id = payload.scan_id;
        let results: Vec<(usize, usize, Result<PairVerdict, PhaseError>)> = stream::iter(pairs)
            .map(|(a, b)| async move {
                let verdict = self
                    .verify_pair(scan_id, &descriptions[a], &descriptions[b])
                    .await;
                (a, b, verdict)
            })
            .buffer_unordered(self.scan_config.concurrency.max(1))
            .collect()
            .await;

        let mut edges: Vec<(usize, usize, f64, String)> = Vec::new();
        for (a, b, verdict) in results {
            let verdict = verdict?;
            if verdict.is_duplicate {
                edges.push((a, b, verdict.confidence, verdict.relationship));
            }
        }

        let pr_ids: Vec<i64> = prs.iter().map(|pr| pr.id).collect();
        Ok(build_verified_groups(&pr_ids, edges))
    }
}

/// Confidence-ordered greedy clique construction over the confirmed-edge
/// subgraph of one candidate group. Not transitive closure: a member is only
/// admitted to a clique once every existing member has a confirmed edge to
/// it, so one false-positive pairwise verdict can't pull an unrelated PR into
/// an otherwise-solid group. `edges` need not be pre-sorted.
fn build_verified_groups(pr_ids: &[i64], mut edges: Vec<(usize, usize, f64, String)>) -> Vec<VerifiedGroup> {
    edges.sort_by(|x, y| y.2.partial_cmp(&x.2).unwrap_or(std::cmp::Ordering::Equal));

    let mut adjacency: HashMap<usize, HashSet<usize>> = HashMap::new();
    for &(a, b, _, _) in &edges {
        adjacency.entry(a).or_default().insert(b);
        adjacency.entry(b).or_default().insert(a);
    }

    let mut used: HashSet<usize> = HashSet::new();
    let mut verified = Vec::new();
    for (a, b, seed_confidence, seed_relationship) in &edges {
        if used.contains(a) || used.contains(b) {
            continue;
        }
        let mut clique = vec![*a, *b];
        loop {
            let candidate = (0..pr_ids.len()).find(|v| {
                !clique.contains(v)
                    && !used.contains(v)
                    && clique.iter().all(|m| adjacency.get(m).is_some_and(|s| s.contains(v)))
            });
            match candidate {
                Some(v) => clique.push(v),
                None => break,
            }
        }
        for &member in &clique {
            used.insert(member);
        }

        let internal_edges: Vec<f64> = edges
            .iter()
            .filter(|(x, y, _, _)| clique.contains(x) && clique.contains(y))
            .map(|(_, _, conf, _)| *conf)
            .collect();
        let avg_confidence = if internal_edges.is_empty() {
            *seed_confidence
        } else {
            internal_edges.iter().sum::<f64>() / internal_edges.len() as f64
        };

        verified.push(VerifiedGroup {
            pr_ids: clique.iter().map(|&i| pr_ids[i]).collect(),
            label: seed_relationship.clone(),
            confidence: avg_confidence,
            relationship: seed_relationship.clone(),
        });
    }

    verified
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmed_triangle_becomes_one_group_of_three() {
        let pr_ids = vec![100, 200, 300];
        let edges = vec![
            (0, 1, 0.95, "same fix".to_string()),
            (0, 2, 0.90, "same fix".to_string()),
            (1, 2, 0.88, "same fix".to_string()),
        ];
        let groups = build_verified_groups(&pr_ids, edges);
        assert_eq!(groups.len(), 1);
        let mut members = groups[0].pr_ids.clone();
        members.sort_unstable();
        assert_eq!(members, vec![100, 200, 300]);
    }

    #[test]
    fn one_missing_edge_keeps_the_odd_pr_out_of_the_confirmed_pair() {
        // 0-1 and 0-2 confirmed, but 1-2 is not: no clique covers all three.
        // The highest-confidence edge (0-1) wins the group and claims PR 0,
        // so the weaker edge (0-2) can no longer form a second group around
        // the same PR: PR 300 ends up in no verified group at all.
        let pr_ids = vec![100, 200, 300];
        let edges = vec![
            (0, 1, 0.95, "same fix".to_string()),
            (0, 2, 0.70, "maybe related".to_string()),
        ];
        let groups = build_verified_groups(&pr_ids, edges);
        assert_eq!(groups.len(), 1);
        let members: HashSet<i64> = groups[0].pr_ids.iter().copied().collect();
        assert_eq!(members, HashSet::from([100, 200]));
    }

    #[test]
    fn no_confirmed_edges_yields_no_groups() {
        assert!(build_verified_groups(&[100, 200], vec![]).is_empty());
    }
}
