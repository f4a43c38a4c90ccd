//! Crawl orchestration: run lock, job tracking, dedup, payload batching,
//! workflow delivery and the cron scheduler.

mod batch;
mod config;
mod dedup;
mod executor;
mod jobs;
mod scheduler;
mod service;

pub use batch::{
    batch_id, payload_size, split_to_fit, BatchError, BatchLimits, PlannedBatch, WorkflowPayload,
    DEFAULT_EVENT_TYPE, DEFAULT_PAYLOAD_MARGIN, HARD_PAYLOAD_LIMIT,
};
pub use config::{SyncConfig, MAX_SOURCE_CONCURRENCY};
pub use dedup::{release_claims, Admission, DedupEngine, DedupOutcome};
pub use executor::{
    deliver, DeliveryReport, ExecutionHandle, HttpWorkflowExecutor, StoreWorkflowExecutor,
    WorkflowExecutor,
};
pub use jobs::{JobTracker, RunGuard, RunLock, DEFAULT_JOB_RETENTION};
pub use scheduler::maybe_build_scheduler;
pub use service::{CrawlError, CrawlService, RunOptions, RunSummary};

pub const CRATE_NAME: &str = "harvest-sync";

/// One manual crawl using environment configuration.
pub async fn run_crawl_once_from_env(sources: Option<Vec<String>>) -> anyhow::Result<RunSummary> {
    let config = SyncConfig::from_env();
    let service = CrawlService::from_config(&config)?;
    Ok(service.run_manual(sources).await?)
}
