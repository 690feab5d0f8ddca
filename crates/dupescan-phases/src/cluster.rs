use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use dupescan_core::db::Db;
use dupescan_core::queue::JobQueue;
use dupescan_core::types::{CandidateGroup, ClusterJobPayload, JobType, ScanConfig, ScanStatus, VerifyJobPayload};
use dupescan_core::vector::VectorStore;
use dupescan_core::{vector_point_key, Job, PhaseError};

use crate::processor::{PhaseProcessor, ProcessOutcome};
use crate::support::fail_scan;

/// Disjoint-set union over PR numbers with path compression and union by
/// rank, indexed by position in an externally-owned list of PR numbers.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Builds candidate groups from exact-diff matches plus `code`/`intent`
/// vector-similarity neighbours (spec.md §4.5). This is a recall stage:
/// thresholds are tuned to over-group, leaving precision to verify.
pub struct ClusterProcessor {
    db: Arc<Db>,
    vector_store: Arc<dyn VectorStore>,
    scan_config: ScanConfig,
    job_max_retries: i32,
    job_base_backoff_ms: u64,
}

impl ClusterProcessor {
    pub fn new(
        db: Arc<Db>,
        vector_store: Arc<dyn VectorStore>,
        scan_config: ScanConfig,
        job_max_retries: i32,
        job_base_backoff_ms: u64,
    ) -> Self {
        Self {
            db,
            vector_store,
            scan_config,
            job_max_retries,
            job_base_backoff_ms,
        }
    }
}

#[async_trait]
impl PhaseProcessor for ClusterProcessor {
    fn job_type(&self) -> JobType {
        JobType::Cluster
    }

    async fn process(&self, job: &Job) -> Result<ProcessOutcome, PhaseError> {
        let payload: ClusterJobPayload =
            serde_json::from_value(job.payload.clone()).map_err(PhaseError::data)?;
        let scan_id = payload.scan_id;

        match self.run(payload).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.retryable() => Err(e),
            Err(e) => fail_scan(&self.db, scan_id, &e).await,
        }
    }
}

impl ClusterProcessor {
    async fn run(&self, payload: ClusterJobPayload) -> Result<ProcessOutcome, PhaseError> {
        self.db
            .update_scan_status(payload.scan_id, ScanStatus::Clustering, None)
            .await
            .map_err(PhaseError::transient)?;

        let open_prs = self
            .db
            .list_open_prs_for_repo(payload.repo_id)
            .await
            .map_err(PhaseError::transient)?;

        let index_of: HashMap<i64, usize> = open_prs
            .iter()
            .enumerate()
            .map(|(i, pr)| (pr.number, i))
            .collect();
        let mut uf = UnionFind::new(open_prs.len());

        // Exact-diff path: union every PR sharing a non-null diffHash.
        let mut by_hash: HashMap<&str, Vec<usize>> = HashMap::new();
        for pr in &open_prs {
            if let Some(hash) = pr.diff_hash.as_deref() {
                by_hash.entry(hash).or_default().push(index_of[&pr.number]);
            }
        }
        for group in by_hash.values() {
            for w in group.windows(2) {
                uf.union(w[0], w[1]);
            }
        }

        // Similarity path: code and intent collections independently.
        for (collection, threshold) in [
            (&self.scan_config.code_collection, self.scan_config.code_similarity_threshold),
            (&self.scan_config.intent_collection, self.scan_config.intent_similarity_threshold),
        ] {
            let kind = if collection == &self.scan_config.code_collection { "code" } else { "intent" };
            for pr in &open_prs {
                let key = vector_point_key(payload.repo_id, pr.number, kind);
                let Some(vector) = self
                    .vector_store
                    .get_point(collection, &key)
                    .await
                    .map_err(PhaseError::transient)?
                else {
                    continue;
                };
                let hits = self
                    .vector_store
                    .search(
                        collection,
                        vector,
                        self.scan_config.cluster_search_limit,
                        Some(payload.repo_id),
                    )
                    .await
                    .map_err(PhaseError::transient)?;
                for hit in hits {
                    if hit.score < threshold as f32 {
                        continue;
                    }
                    let Some(neighbour_number) = hit
                        .payload
                        .get("pr_number")
                        .and_then(|v| v.as_i64())
                    else {
                        continue;
                    };
                    if neighbour_number == pr.number {
                        continue;
                    }
                    if let Some(&j) = index_of.get(&neighbour_number) {
                        uf.union(index_of[&pr.number], j);
                    }
                }
            }
        }

        // Extract connected components with >= 2 members.
        let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..open_prs.len() {
            let root = uf.find(i);
            components.entry(root).or_default().push(i);
        }

        let mut candidate_groups = Vec::new();
        for indices in components.values() {
            if indices.len() < 2 {
                continue;
            }
            let mut pr_numbers: Vec<i64> = indices.iter().map(|&i| open_prs[i].number).collect();
            let mut pr_ids: Vec<i64> = indices.iter().map(|&i| open_prs[i].id).collect();
            pr_numbers.sort_unstable();
            pr_ids.sort_unstable();
            candidate_groups.push(CandidateGroup { pr_numbers, pr_ids });
        }
        candidate_groups.sort_by(|a, b| a.pr_numbers.cmp(&b.pr_numbers));

        self.db
            .update_scan_phase_cursor(
                payload.scan_id,
                serde_json::json!({"candidateGroups": candidate_groups}),
            )
            .await
            .map_err(PhaseError::transient)?;

        let queue = JobQueue::new(&self.db, self.job_base_backoff_ms);
        let verify_payload = VerifyJobPayload {
            repo_id: payload.repo_id,
            scan_id: payload.scan_id,
            account_id: payload.account_id,
            owner: payload.owner.clone(),
            repo: payload.repo.clone(),
            candidate_groups: candidate_groups.clone(),
        };
        queue
            .enqueue(
                JobType::Verify,
                serde_json::to_value(&verify_payload).map_err(PhaseError::data)?,
                Some(payload.scan_id),
                self.job_max_retries,
            )
            .await
            .map_err(PhaseError::transient)?;

        info!(scan_id = payload.scan_id, groups = candidate_groups.len(), "cluster complete");
        Ok(ProcessOutcome::Completed(
            serde_json::json!({"candidateGroups": candidate_groups.len()}),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_find_merges_transitively() {
        let mut uf = UnionFind::new(5);
        uf.union(0, 1);
        uf.union(1, 2);
        assert_eq!(uf.find(0), uf.find(2));
        assert_ne!(uf.find(0), uf.find(3));
        uf.union(3, 4);
        assert_eq!(uf.find(3), uf.find(4));
        assert_ne!(uf.find(0), uf.find(3));
    }

    #[test]
    fn union_find_is_idempotent() {
        let mut uf = UnionFind::new(3);
        uf.union(0, 1);
        uf.union(0, 1);
        uf.union(1, 0);
        assert_eq!(uf.find(0), uf.find(1));
    }
}
