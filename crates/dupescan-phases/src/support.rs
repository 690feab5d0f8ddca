use sha2::{Digest, Sha256};

use dupescan_core::db::Db;
use dupescan_core::types::ScanStatus;
use dupescan_core::PhaseError;
use dupescan_providers::SourceHostError;

use crate::processor::ProcessOutcome;

/// Classifies a `SourceHost` call's failure per spec.md §4.3/§7: auth and
/// 404 responses are fatal configuration/data errors, never retried through
/// the queue; everything else (network blips, 5xx, rate limits the client
/// didn't already retry internally) is transient.
pub fn classify_source_host_err(err: anyhow::Error) -> PhaseError {
    match err.downcast::<SourceHostError>() {
        Ok(SourceHostError::Auth(msg)) => PhaseError::configuration(anyhow::anyhow!(msg)),
        Ok(SourceHostError::NotFound(msg)) => PhaseError::data(anyhow::anyhow!(msg)),
        Err(err) => PhaseError::transient(err),
    }
}

/// Marks the owning scan `failed` with `err`'s message and returns the
/// `ScanFailed` outcome the worker loop records against the job. Best-effort:
/// if the database write itself fails we log and still report the job as
/// failed rather than let a fatal phase error retry forever.
pub async fn fail_scan(
    db: &Db,
    scan_id: i64,
    err: &PhaseError,
) -> Result<ProcessOutcome, PhaseError> {
    if let Err(write_err) = db
        .update_scan_status(scan_id, ScanStatus::Failed, Some(&err.to_string()))
        .await
    {
        tracing::error!(scan_id, error = %write_err, "failed to persist scan failure");
    }
    Ok(ProcessOutcome::ScanFailed)
}

/// Stable content hash of a normalised unified diff: line endings collapsed
/// to `\n`, trailing whitespace trimmed per line. Two diffs that differ only
/// in whitespace/CRLF hash identically, matching spec.md §3's `diffHash`.
pub fn normalize_and_hash_diff(diff: &str) -> String {
    let normalized: String = diff
        .replace("\r\n", "\n")
        .lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Truncates `s` to at most `max_chars` characters on a char boundary,
/// appending a marker — used for diff excerpts in verify/rank LLM prompts,
/// distinct from embed's token-budgeted truncation.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("\n... (truncated)");
    out
}

/// Parses a chat provider's response as JSON matching `T`, tolerating the
/// common "wrapped in a markdown code fence" shape some chat completion
/// APIs produce even when asked for raw JSON.
pub fn parse_json_response<T: serde::de::DeserializeOwned>(content: &str) -> anyhow::Result<T> {
    let trimmed = content.trim();
    let candidate = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim_end_matches("```").trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim_end_matches("```").trim()
    } else {
        trimmed
    };
    Ok(serde_json::from_str(candidate)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_hash_ignores_whitespace_and_line_endings() {
        let a = "line one\r\nline two  \r\n";
        let b = "line one\nline two\n";
        assert_eq!(normalize_and_hash_diff(a), normalize_and_hash_diff(b));
    }

    #[test]
    fn diff_hash_differs_for_different_content() {
        assert_ne!(
            normalize_and_hash_diff("a"),
            normalize_and_hash_diff("b")
        );
    }

    #[test]
    fn truncate_chars_is_noop_within_budget() {
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[test]
    fn truncate_chars_shrinks_oversized_text() {
        let long = "x".repeat(100);
        let truncated = truncate_chars(&long, 10);
        assert!(truncated.starts_with(&"x".repeat(10)));
        assert!(truncated.contains("truncated"));
    }

    #[derive(serde::Deserialize, PartialEq, Debug)]
    struct Sample {
        ok: bool,
    }

    #[test]
    fn parse_json_response_strips_markdown_fence() {
        let fenced = "```json\n{\"ok\": true}\n```";
        let parsed: Sample = parse_json_response(fenced).unwrap();
        assert_eq!(parsed, Sample { ok: true });
    }

    #[test]
    fn parse_json_response_handles_bare_json() {
        let parsed: Sample = parse_json_response("{\"ok\": false}").unwrap();
        assert_eq!(parsed, Sample { ok: false });
    }
}
