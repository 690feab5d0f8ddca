use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dupescan_core::{Job, JobType, PhaseError};

/// What a processor did with the job it was handed. The worker loop turns
/// this (or an `Err`) into a `JobQueue` call — it never inspects scan state
/// itself, per the "phaseCursor is owned exclusively by the processor of the
/// scan's current phase" rule in spec.md §3.
pub enum ProcessOutcome {
    /// The phase succeeded; `result` is stored on the job row. A successor
    /// job has already been enqueued (or this was the terminal `rank` phase).
    Completed(serde_json::Value),
    /// Fatal failure: the processor already transitioned the owning scan to
    /// `failed` and set its `error`. The job itself is recorded failed,
    /// non-retryable, with no successor enqueued.
    ScanFailed,
}

/// The common contract every phase processor implements (spec.md §4.2):
/// decode payload, advance scan state, do the phase's work, enqueue the
/// successor, and report retryable vs. fatal failures distinctly.
#[async_trait]
pub trait PhaseProcessor: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn process(&self, job: &Job) -> Result<ProcessOutcome, PhaseError>;
}

/// Registry mapping each `JobType` to the processor that handles it. The
/// worker loop dispatches through this instead of hard-coding a five-armed
/// match.
#[derive(Default)]
pub struct Dispatcher {
    processors: HashMap<JobType, Arc<dyn PhaseProcessor>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn PhaseProcessor>) -> &mut Self {
        self.processors.insert(processor.job_type(), processor);
        self
    }

    pub fn job_types(&self) -> Vec<JobType> {
        self.processors.keys().copied().collect()
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn PhaseProcessor>> {
        self.processors.get(&job_type).cloned()
    }
}
