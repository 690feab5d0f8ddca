pub mod cluster;
pub mod embed;
pub mod ingest;
pub mod orchestrator;
pub mod processor;
pub mod rank;
pub mod support;
pub mod verify;

pub use cluster::ClusterProcessor;
pub use embed::EmbedProcessor;
pub use ingest::IngestProcessor;
pub use orchestrator::ScanOrchestrator;
pub use processor::{Dispatcher, PhaseProcessor, ProcessOutcome};
pub use rank::RankProcessor;
pub use verify::VerifyProcessor;
