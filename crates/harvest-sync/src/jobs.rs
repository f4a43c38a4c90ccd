use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use harvest_core::{CrawlJob, JobStatus, SourceProgress};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Finished jobs kept in memory before the oldest are pruned.
pub const DEFAULT_JOB_RETENTION: usize = 200;

/// Single-flight guard shared by scheduled and manual runs.
#[derive(Debug, Clone, Default)]
pub struct RunLock {
    running: Arc<AtomicBool>,
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claims the lock; `None` when a run already holds it.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard {
                running: Arc::clone(&self.running),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the run lock when dropped, including on early return or panic unwind.
#[derive(Debug)]
pub struct RunGuard {
    running: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct JobTracker {
    jobs: RwLock<HashMap<Uuid, CrawlJob>>,
    retention: usize,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention: retention.max(1),
        }
    }

    /// Registers a job and marks it running.
    pub async fn create_job(&self, source_names: Vec<String>) -> CrawlJob {
        let mut job = CrawlJob::new(source_names);
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        info!(job_id = %job.id, sources = job.source_names.len(), "crawl job started");

        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id, job.clone());
        prune(&mut jobs, self.retention);
        job
    }

    pub async fn get(&self, id: Uuid) -> Option<CrawlJob> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// Newest first.
    pub async fn list(&self) -> Vec<CrawlJob> {
        let mut jobs: Vec<_> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs
    }

    pub async fn record_progress(&self, id: Uuid, source_name: &str, events_found: usize) {
        self.update(id, |job| {
            job.events_found += events_found;
            job.sources.push(SourceProgress {
                source_name: source_name.to_string(),
                events_found,
                error: None,
            });
        })
        .await;
    }

    /// Per-source failure. The job keeps running.
    pub async fn record_error(&self, id: Uuid, source_name: &str, error: &str) {
        warn!(job_id = %id, source = source_name, error, "source failed");
        self.update(id, |job| {
            job.sources.push(SourceProgress {
                source_name: source_name.to_string(),
                events_found: 0,
                error: Some(error.to_string()),
            });
        })
        .await;
    }

    pub async fn record_counts(&self, id: Uuid, duplicates: usize, rejected: usize) {
        self.update(id, |job| {
            job.duplicates += duplicates;
            job.rejected += rejected;
        })
        .await;
    }

    pub async fn record_saved(&self, id: Uuid, events_saved: usize) {
        self.update(id, |job| job.events_saved = events_saved).await;
    }

    /// Non-fatal run-level note, e.g. some batches failed.
    pub async fn record_warning(&self, id: Uuid, message: &str) {
        self.update(id, |job| job.error = Some(message.to_string()))
            .await;
    }

    pub async fn complete_job(&self, id: Uuid, events_saved: usize) -> Option<CrawlJob> {
        let job = self
            .update(id, |job| {
                job.events_saved = events_saved;
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
            })
            .await;
        if let Some(job) = &job {
            info!(job_id = %id, found = job.events_found, saved = events_saved, "crawl job completed");
        }
        job
    }

    pub async fn fail_job(&self, id: Uuid, error: &str) -> Option<CrawlJob> {
        warn!(job_id = %id, error, "crawl job failed");
        self.update(id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
            job.completed_at = Some(Utc::now());
        })
        .await
    }

    /// Applies `f` to a non-terminal job. Finished jobs are immutable.
    async fn update(&self, id: Uuid, f: impl FnOnce(&mut CrawlJob)) -> Option<CrawlJob> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id)?;
        if job.status.is_terminal() {
            warn!(job_id = %id, status = ?job.status, "ignoring update to finished job");
            return None;
        }
        f(job);
        Some(job.clone())
    }
}

fn prune(jobs: &mut HashMap<Uuid, CrawlJob>, retention: usize) {
    if jobs.len() <= retention {
        return;
    }
    let mut finished: Vec<_> = jobs
        .values()
        .filter(|j| j.status.is_terminal())
        .map(|j| (j.completed_at, j.id))
        .collect();
    finished.sort();
    let excess = jobs.len() - retention;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
}
