use thiserror::Error;

/// The four failure kinds a phase processor can report. The worker loop uses
/// `retryable()` to decide whether to release a job back to the queue with
/// backoff or mark the owning scan failed outright.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// Network blip, rate limit, timeout — retry through the queue.
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Malformed or unexpected data from a provider or a prior phase.
    /// Retried once; a second occurrence is treated as fatal.
    #[error("data error: {0}")]
    Data(anyhow::Error),

    /// Missing or invalid configuration (API key, collection name, base url).
    /// Never worth retrying.
    #[error("configuration error: {0}")]
    Configuration(anyhow::Error),

    /// An invariant from spec.md §8 was violated. Fatal; the owning scan
    /// transitions to `failed`.
    #[error("invariant violation: {0}")]
    Invariant(anyhow::Error),
}

impl PhaseError {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Errors a caller should retry exactly once before giving up, distinct
    /// from `Transient` which the queue retries up to `max_retries` times.
    pub fn retry_once(&self) -> bool {
        matches!(self, Self::Data(_))
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn data(err: impl Into<anyhow::Error>) -> Self {
        Self::Data(err.into())
    }

    pub fn configuration(err: impl Into<anyhow::Error>) -> Self {
        Self::Configuration(err.into())
    }

    pub fn invariant(err: impl Into<anyhow::Error>) -> Self {
        Self::Invariant(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        let t = PhaseError::transient(anyhow::anyhow!("boom"));
        let d = PhaseError::data(anyhow::anyhow!("boom"));
        let c = PhaseError::configuration(anyhow::anyhow!("boom"));
        let i = PhaseError::invariant(anyhow::anyhow!("boom"));

        assert!(t.retryable());
        assert!(!d.retryable());
        assert!(!c.retryable());
        assert!(!i.retryable());

        assert!(d.retry_once());
        assert!(!t.retry_once());
    }
}
