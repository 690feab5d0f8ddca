use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Repo ─────────────────────────────────────────────────────────────────

/// A tracked source-control repository. Unique on `(owner, name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ── Pull request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Merged => "merged",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "merged" => Some(Self::Merged),
            _ => None,
        }
    }
}

/// A pull request as tracked by a scan. Unique on `(repo_id, number)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pr {
    pub id: i64,
    pub repo_id: i64,
    pub number: i64,
    pub title: String,
    pub body: String,
    pub author: String,
    /// Stable hash of the normalized diff (whitespace/line-ending collapsed).
    pub diff_hash: Option<String>,
    pub file_paths: Vec<String>,
    pub state: PrState,
    pub github_etag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Scan ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Ingesting,
    Embedding,
    Clustering,
    Verifying,
    Ranking,
    Done,
    Failed,
    Paused,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Ingesting => "ingesting",
            Self::Embedding => "embedding",
            Self::Clustering => "clustering",
            Self::Verifying => "verifying",
            Self::Ranking => "ranking",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => Self::Queued,
            "ingesting" => Self::Ingesting,
            "embedding" => Self::Embedding,
            "clustering" => Self::Clustering,
            "verifying" => Self::Verifying,
            "ranking" => Self::Ranking,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "paused" => Self::Paused,
            _ => return None,
        })
    }

    /// Is this a terminal state (scan will not transition further on its own)?
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Token usage accounting for a scan. Intent-summary LLM calls count under
/// `chat_input_tokens` / `chat_output_tokens` (resolves spec.md §9's open
/// question — see DESIGN.md).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    pub embed_input_tokens: i64,
    pub chat_input_tokens: i64,
    pub chat_output_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub id: i64,
    pub repo_id: i64,
    pub status: ScanStatus,
    /// Opaque JSON owned exclusively by the processor of the current phase.
    pub phase_cursor: Value,
    pub pr_count: i64,
    pub dupe_group_count: i64,
    pub token_usage: TokenUsage,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Dupe groups ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DupeGroup {
    pub id: i64,
    pub scan_id: i64,
    pub repo_id: i64,
    pub label: String,
    pub pr_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DupeGroupMember {
    pub id: i64,
    pub group_id: i64,
    pub pr_id: i64,
    /// 1-indexed; rank 1 is the PR to keep.
    pub rank: i64,
    pub score: f64,
    pub rationale: String,
}

// ── Jobs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Scan,
    Ingest,
    Embed,
    Cluster,
    Verify,
    Rank,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Ingest => "ingest",
            Self::Embed => "embed",
            Self::Cluster => "cluster",
            Self::Verify => "verify",
            Self::Rank => "rank",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "scan" => Self::Scan,
            "ingest" => Self::Ingest,
            "embed" => Self::Embed,
            "cluster" => Self::Cluster,
            "verify" => Self::Verify,
            "rank" => Self::Rank,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "paused" => Self::Paused,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub payload: Value,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: i32,
    pub max_retries: i32,
    pub run_after: DateTime<Utc>,
    /// Convenience FK populated at enqueue time; phase payloads remain the
    /// source of truth for which scan a job belongs to.
    pub scan_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Job payloads ─────────────────────────────────────────────────────────
//
// Each phase's contract (spec.md §4.3-§4.7) is modeled as its own payload
// struct so `serde_json::from_value` gives a decode error (a Data-kind
// failure, see error.rs) instead of a silent default when a phase receives
// the wrong shape.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJobPayload {
    pub scan_id: i64,
    pub repo_id: i64,
    /// Account whose provider config (source host token, embedding/chat
    /// provider selection) this scan runs under. Threaded unchanged through
    /// every phase payload; provider *selection* from this id happens once,
    /// externally, at scan-creation time (spec.md §9 "polymorphism over
    /// providers... not in hot paths") — phases never re-resolve it.
    pub account_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJobPayload {
    pub repo_id: i64,
    pub scan_id: i64,
    pub account_id: i64,
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedJobPayload {
    pub repo_id: i64,
    pub scan_id: i64,
    pub account_id: i64,
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateGroup {
    pub pr_numbers: Vec<i64>,
    pub pr_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterJobPayload {
    pub repo_id: i64,
    pub scan_id: i64,
    pub account_id: i64,
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyJobPayload {
    pub repo_id: i64,
    pub scan_id: i64,
    pub account_id: i64,
    pub owner: String,
    pub repo: String,
    pub candidate_groups: Vec<CandidateGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedGroup {
    pub pr_ids: Vec<i64>,
    pub label: String,
    pub confidence: f64,
    pub relationship: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankJobPayload {
    pub repo_id: i64,
    pub scan_id: i64,
    pub owner: String,
    pub repo: String,
    pub verified_groups: Vec<VerifiedGroup>,
}

// ── Scan configuration (resolved at scan-creation time) ───────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub code_similarity_threshold: f64,
    pub intent_similarity_threshold: f64,
    pub concurrency: usize,
    pub code_collection: String,
    pub intent_collection: String,
    pub embed_batch_size: usize,
    /// When true, embed produces the intent text via a single chat-provider
    /// call per PR instead of the deterministic title/body/file-path template.
    pub intent_summary_via_llm: bool,
    /// Neighbours considered per PR when cluster searches a collection.
    pub cluster_search_limit: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            code_similarity_threshold: 0.85,
            intent_similarity_threshold: 0.80,
            concurrency: 4,
            code_collection: "code".to_string(),
            intent_collection: "intent".to_string(),
            embed_batch_size: 64,
            intent_summary_via_llm: false,
            cluster_search_limit: 20,
        }
    }
}

pub const TOKEN_BUDGET_FACTOR: f64 = 0.95;

/// Point key for a PR's vector in a given collection, per spec.md §3's
/// "at most one point per collection" invariant.
pub fn vector_point_key(repo_id: i64, pr_number: i64, kind: &str) -> String {
    format!("{repo_id}-{pr_number}-{kind}")
}
