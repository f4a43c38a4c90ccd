//! Crawl run orchestration: extraction per source, normalization, dedup,
//! batching and delivery, tracked as one [`CrawlJob`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use harvest_adapters::{
    ExtractionEngine, HttpAiExtractor, HttpPageAutomation, ScheduleBucket, SourceConfig,
    SourceExtraction, SourceRegistry,
};
use harvest_core::{CrawlJob, NormalizedEvent};
use harvest_normalize::{normalize_record, SourceHints};
use harvest_storage::{EventStore, FileEventStore, HttpFetcher};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::{split_to_fit, BatchError, BatchLimits, PlannedBatch, DEFAULT_EVENT_TYPE};
use crate::config::SyncConfig;
use crate::dedup::{release_claims, Admission, DedupEngine};
use crate::executor::{deliver, HttpWorkflowExecutor, StoreWorkflowExecutor, WorkflowExecutor};
use crate::jobs::{JobTracker, RunLock};

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("a crawl run is already in progress")]
    AlreadyRunning,
    #[error("unknown source(s): {}", .0.join(", "))]
    UnknownSources(Vec<String>),
    #[error(transparent)]
    Oversize(#[from] BatchError),
    #[error("all {total} batch submissions failed; first error: {first_error}")]
    SubmissionFailed { total: usize, first_error: String },
    #[error("run deadline of {deadline:?} exceeded; skipped sources: [{}]; skipped batches: {skipped_batches}", .skipped_sources.join(", "))]
    DeadlineExceeded {
        deadline: Duration,
        skipped_sources: Vec<String>,
        skipped_batches: usize,
    },
}

impl CrawlError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub politeness_delay: Duration,
    pub source_concurrency: usize,
    pub limits: BatchLimits,
    pub batch_name: String,
    pub event_type: String,
    pub cross_run_dedup: bool,
    pub deadline: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            politeness_delay: Duration::from_secs(2),
            source_concurrency: 1,
            limits: BatchLimits::default(),
            batch_name: "events".to_string(),
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            cross_run_dedup: true,
            deadline: None,
        }
    }
}

impl RunOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            politeness_delay: Duration::from_millis(config.politeness_delay_ms),
            source_concurrency: config.source_concurrency,
            limits: config.batch_limits(),
            batch_name: config.batch_name.clone(),
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            cross_run_dedup: config.cross_run_dedup,
            deadline: config.run_deadline(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub job_id: Uuid,
    pub sources: Vec<String>,
    pub events_found: usize,
    pub events_normalized: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub events_forwarded: usize,
    pub events_saved: usize,
    pub batches_submitted: usize,
    pub batches_failed: usize,
}

enum SourceRun {
    Extracted(SourceExtraction),
    Skipped,
    TimedOut,
}

pub struct CrawlService {
    registry: Arc<SourceRegistry>,
    engine: Arc<ExtractionEngine>,
    store: Arc<dyn EventStore>,
    executor: Arc<dyn WorkflowExecutor>,
    jobs: Arc<JobTracker>,
    lock: RunLock,
    options: RunOptions,
}

impl CrawlService {
    pub fn new(
        registry: Arc<SourceRegistry>,
        engine: Arc<ExtractionEngine>,
        store: Arc<dyn EventStore>,
        executor: Arc<dyn WorkflowExecutor>,
        options: RunOptions,
    ) -> Self {
        Self {
            registry,
            engine,
            store,
            executor,
            jobs: Arc::new(JobTracker::new()),
            lock: RunLock::new(),
            options,
        }
    }

    /// Wires HTTP page loading, the optional AI collaborator, the file store and
    /// the configured workflow executor.
    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(SourceRegistry::load(&config.sources_file)?);
        let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let pages = Arc::new(HttpPageAutomation::new(fetcher.clone()));
        let ai = config.ai_endpoint.as_ref().map(|endpoint| {
            Arc::new(HttpAiExtractor::new(
                fetcher.clone(),
                endpoint.clone(),
                config.ai_token.clone(),
                Duration::from_secs(config.ai_timeout_secs),
            )) as Arc<dyn harvest_adapters::AiExtractor>
        });
        let engine = Arc::new(ExtractionEngine::new(pages, ai, config.strategy_config()));
        let store: Arc<dyn EventStore> = Arc::new(FileEventStore::new(config.store_dir.clone()));
        let executor: Arc<dyn WorkflowExecutor> = match &config.workflow_endpoint {
            Some(endpoint) => Arc::new(HttpWorkflowExecutor::new(
                fetcher.clone(),
                endpoint.clone(),
                config.workflow_token.clone(),
            )),
            None => Arc::new(StoreWorkflowExecutor::new(store.clone())),
        };
        info!(
            sources = registry.sources.len(),
            ai = engine.ai_enabled(),
            remote_workflow = config.workflow_endpoint.is_some(),
            "crawl service ready"
        );
        Ok(Self::new(
            registry,
            engine,
            store,
            executor,
            RunOptions::from_config(config),
        ))
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn jobs(&self) -> &Arc<JobTracker> {
        &self.jobs
    }

    pub fn run_lock(&self) -> &RunLock {
        &self.lock
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Manual trigger. An empty or missing list means every enabled source.
    pub async fn run_manual(&self, sources: Option<Vec<String>>) -> Result<RunSummary, CrawlError> {
        let names = match sources.filter(|s| !s.is_empty()) {
            None => self.registry.enabled_names(),
            Some(names) => {
                let unknown: Vec<_> = names
                    .iter()
                    .filter(|n| self.registry.get(n).is_none())
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    return Err(CrawlError::UnknownSources(unknown));
                }
                names
            }
        };
        self.run(names).await
    }

    pub async fn run_bucket(&self, bucket: ScheduleBucket) -> Result<RunSummary, CrawlError> {
        let names = self.registry.bucket_names(bucket);
        info!(%bucket, sources = names.len(), "scheduled bucket triggered");
        self.run(names).await
    }

    /// Single-flight run over `source_names`. Rejected immediately with
    /// [`CrawlError::AlreadyRunning`] while another run holds the lock.
    ///
    /// Repeated names are crawled once, at their first position.
    pub async fn run(&self, source_names: Vec<String>) -> Result<RunSummary, CrawlError> {
        let Some(_guard) = self.lock.try_acquire() else {
            warn!(requested = ?source_names, "crawl already running; rejecting request");
            return Err(CrawlError::AlreadyRunning);
        };

        let mut seen = HashSet::new();
        let source_names: Vec<String> = source_names
            .into_iter()
            .filter(|name| seen.insert(name.clone()))
            .collect();
        let job = self.jobs.create_job(source_names).await;
        let span = info_span!("crawl_run", job_id = %job.id);
        let result = self.execute(&job).instrument(span).await;
        match &result {
            Ok(summary) => {
                self.jobs.complete_job(job.id, summary.events_saved).await;
            }
            Err(err) => {
                self.jobs.fail_job(job.id, &err.to_string()).await;
            }
        }
        result
    }

    async fn execute(&self, job: &CrawlJob) -> Result<RunSummary, CrawlError> {
        let deadline_at = self.options.deadline.map(|d| Instant::now() + d);
        let sources: Vec<SourceConfig> = job
            .source_names
            .iter()
            .filter_map(|name| self.registry.get(name))
            .cloned()
            .collect();

        let concurrency = self.options.source_concurrency.max(1);
        let job_id = job.id;
        let runs: Vec<SourceRun> = stream::iter(sources.iter().cloned().enumerate())
            .map(move |(position, source)| async move {
                self.crawl_source(job_id, &source, position, concurrency, deadline_at)
                    .await
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut summary = RunSummary {
            job_id: job.id,
            sources: job.source_names.clone(),
            events_found: 0,
            events_normalized: 0,
            rejected: 0,
            duplicates: 0,
            events_forwarded: 0,
            events_saved: 0,
            batches_submitted: 0,
            batches_failed: 0,
        };
        let claims = self
            .options
            .cross_run_dedup
            .then(|| self.store.clone());
        let mut dedup = DedupEngine::new(claims.clone());
        let mut skipped_sources = Vec::new();

        for (source, run) in sources.iter().zip(runs) {
            let extraction = match run {
                SourceRun::Extracted(extraction) if extraction.failure().is_none() => extraction,
                SourceRun::Extracted(_) => continue,
                SourceRun::Skipped | SourceRun::TimedOut => {
                    skipped_sources.push(source.name.clone());
                    continue;
                }
            };
            summary.events_found += extraction.record_count();

            let hints = SourceHints {
                date_formats: &source.date_formats,
                category_mapping: Some(&source.category_mapping),
            };
            for page in &extraction.pages {
                for raw in &page.records {
                    match normalize_record(raw, hints, page.confidence) {
                        Ok(event) => {
                            summary.events_normalized += 1;
                            if let Admission::Upgraded { replaced_key } = dedup.admit(event) {
                                debug!(source = %source.name, replaced_key = %replaced_key, "dedup key upgraded");
                            }
                        }
                        Err(reason) => {
                            summary.rejected += 1;
                            info!(
                                source = %source.name,
                                url = %page.url,
                                title = %raw.title,
                                reason = %reason,
                                "record rejected: parse"
                            );
                        }
                    }
                }
            }
        }

        let outcome = dedup.finish().await;
        summary.duplicates = outcome.duplicates();
        summary.events_forwarded = outcome.events.len();
        self.jobs
            .record_counts(job.id, summary.duplicates, summary.rejected)
            .await;

        let batches = match self.plan_batches(outcome.events) {
            Ok(batches) => batches,
            Err(err) => {
                if let Some(store) = &claims {
                    release_claims(store.as_ref(), outcome.claimed.iter().map(String::as_str))
                        .await;
                }
                return Err(err);
            }
        };
        // Events collected before extraction ran out the clock are still flushed.
        let delivery_deadline = deadline_at.filter(|_| skipped_sources.is_empty());
        let report = deliver(self.executor.as_ref(), &batches, delivery_deadline).await;
        if let Some(store) = &claims {
            let submitted: HashSet<&str> =
                report.submitted.iter().map(|h| h.batch_id.as_str()).collect();
            let delivered: HashSet<&str> = batches
                .iter()
                .filter(|b| submitted.contains(b.id.as_str()))
                .flat_map(|b| b.payload.events.iter().map(|e| e.dedup_key.as_str()))
                .collect();
            let undelivered: Vec<&str> = outcome
                .claimed
                .iter()
                .map(String::as_str)
                .filter(|key| !delivered.contains(key))
                .collect();
            release_claims(store.as_ref(), undelivered).await;
        }
        summary.events_saved = report.events_submitted;
        summary.batches_submitted = report.submitted.len();
        summary.batches_failed = report.failed.len();
        self.jobs.record_saved(job.id, summary.events_saved).await;

        if report.all_failed() {
            let first_error = report
                .failed
                .first()
                .map(|(_, e)| e.clone())
                .unwrap_or_default();
            return Err(CrawlError::SubmissionFailed {
                total: report.failed.len(),
                first_error,
            });
        }
        if !report.failed.is_empty() {
            let note = format!(
                "{} of {} batches failed: {}",
                report.failed.len(),
                report.attempted(),
                report
                    .failed
                    .iter()
                    .map(|(id, e)| format!("{id}: {e}"))
                    .collect::<Vec<_>>()
                    .join("; ")
            );
            self.jobs.record_warning(job.id, &note).await;
        }
        let ran_out = !skipped_sources.is_empty() || !report.skipped.is_empty();
        if let Some(deadline) = self.options.deadline.filter(|_| ran_out) {
            return Err(CrawlError::DeadlineExceeded {
                deadline,
                skipped_sources,
                skipped_batches: report.skipped.len(),
            });
        }

        info!(
            found = summary.events_found,
            rejected = summary.rejected,
            duplicates = summary.duplicates,
            saved = summary.events_saved,
            "crawl run finished"
        );
        Ok(summary)
    }

    /// Extracts one source and records its progress or error on the job as
    /// soon as it completes.
    async fn crawl_source(
        &self,
        job_id: Uuid,
        source: &SourceConfig,
        position: usize,
        concurrency: usize,
        deadline_at: Option<Instant>,
    ) -> SourceRun {
        // Later sources take a slot another source just released.
        if position >= concurrency && !self.options.politeness_delay.is_zero() {
            tokio::time::sleep(self.options.politeness_delay).await;
        }
        let run = match deadline_at {
            None => SourceRun::Extracted(self.engine.extract_source(source).await),
            Some(at) if Instant::now() >= at => {
                info!(source = %source.name, "run deadline reached; source skipped");
                SourceRun::Skipped
            }
            Some(at) => match tokio::time::timeout_at(at, self.engine.extract_source(source)).await
            {
                Ok(extraction) => SourceRun::Extracted(extraction),
                Err(_) => {
                    warn!(source = %source.name, "run deadline reached mid-extraction");
                    SourceRun::TimedOut
                }
            },
        };

        match &run {
            SourceRun::Extracted(extraction) => match extraction.failure() {
                Some(error) => self.jobs.record_error(job_id, &source.name, &error).await,
                None => {
                    self.jobs
                        .record_progress(job_id, &source.name, extraction.record_count())
                        .await
                }
            },
            SourceRun::Skipped => {
                self.jobs
                    .record_error(job_id, &source.name, "skipped: run deadline reached")
                    .await
            }
            SourceRun::TimedOut => {
                self.jobs
                    .record_error(job_id, &source.name, "timed out: run deadline reached")
                    .await
            }
        }
        run
    }

    /// One payload stream per source, in the order sources first appear among
    /// `events`. Any single oversize event fails planning before anything is
    /// submitted.
    fn plan_batches(&self, events: Vec<NormalizedEvent>) -> Result<Vec<PlannedBatch>, CrawlError> {
        let mut groups: Vec<(String, Vec<NormalizedEvent>)> = Vec::new();
        for event in events {
            match groups.iter_mut().find(|(name, _)| *name == event.source_name) {
                Some((_, group)) => group.push(event),
                None => groups.push((event.source_name.clone(), vec![event])),
            }
        }

        let mut planned = Vec::new();
        for (source, group) in &groups {
            let base = format!("{}-{}", self.options.batch_name, source);
            planned.extend(split_to_fit(
                group,
                source,
                &self.options.event_type,
                &base,
                self.options.limits,
            )?);
        }
        Ok(planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::WorkflowPayload;
    use crate::executor::ExecutionHandle;
    use async_trait::async_trait;
    use harvest_adapters::{
        AdapterError, PageAutomation, PageHandle, StrategyConfig,
    };
    use harvest_core::{ExtractionMethod, JobStatus, Price, RawEventRecord};
    use harvest_storage::InMemoryEventStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FixturePages {
        by_source: HashMap<String, Vec<RawEventRecord>>,
        failing: Vec<String>,
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
        /// Restricts the gate to one source; every source is gated when unset.
        gated_source: Option<String>,
        hang: Vec<String>,
    }

    #[async_trait]
    impl PageAutomation for FixturePages {
        async fn navigate(&self, source: &str, url: &str) -> Result<PageHandle, AdapterError> {
            let gated = self.gated_source.as_deref().map_or(true, |g| g == source);
            if let Some((started, release)) = self.gate.as_ref().filter(|_| gated) {
                started.notify_one();
                release.notified().await;
            }
            if self.hang.iter().any(|s| s == source) {
                std::future::pending::<()>().await;
            }
            if self.failing.iter().any(|s| s == source) {
                return Err(AdapterError::Message(format!("{url} unreachable")));
            }
            Ok(PageHandle::new(url, source))
        }

        async fn extract_via_selectors(
            &self,
            page: &PageHandle,
            _source: &SourceConfig,
        ) -> Result<Vec<RawEventRecord>, AdapterError> {
            Ok(self.by_source.get(&page.html).cloned().unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct RecordingExecutor {
        payloads: Mutex<Vec<WorkflowPayload>>,
        fail: bool,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl WorkflowExecutor for RecordingExecutor {
        async fn submit(
            &self,
            batch_id: &str,
            payload: &WorkflowPayload,
        ) -> anyhow::Result<ExecutionHandle> {
            let transient = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if self.fail || transient {
                anyhow::bail!("executor unreachable");
            }
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(ExecutionHandle {
                batch_id: batch_id.to_string(),
                execution_id: format!("exec-{batch_id}"),
            })
        }
    }

    fn source(name: &str) -> SourceConfig {
        let mut source = SourceConfig::new(name, format!("https://{name}.example"));
        source.event_urls = vec![format!("https://{name}.example/events")];
        source
    }

    fn jazz(url: Option<&str>) -> RawEventRecord {
        RawEventRecord {
            date_text: Some("June 15, 2024".into()),
            time_text: Some("7:00 PM".into()),
            price_text: Some("$45".into()),
            detail_url: url.map(Into::into),
            ..RawEventRecord::new("Jazz Night", "riverside")
        }
    }

    fn service_with(
        pages: FixturePages,
        names: &[&str],
        executor: Arc<RecordingExecutor>,
        options: RunOptions,
    ) -> CrawlService {
        let registry = SourceRegistry {
            sources: names.iter().map(|n| source(n)).collect(),
        };
        let engine = ExtractionEngine::new(Arc::new(pages), None, StrategyConfig::default());
        CrawlService::new(
            Arc::new(registry),
            Arc::new(engine),
            Arc::new(InMemoryEventStore::new()),
            executor,
            options,
        )
    }

    fn quick() -> RunOptions {
        RunOptions {
            politeness_delay: Duration::ZERO,
            ..RunOptions::default()
        }
    }

    #[tokio::test]
    async fn jazz_night_end_to_end() {
        let mut pages = FixturePages::default();
        pages
            .by_source
            .insert("riverside".into(), vec![jazz(None), jazz(Some("https://x/y"))]);
        let executor = Arc::new(RecordingExecutor::default());
        let service = service_with(pages, &["riverside"], executor.clone(), quick());

        let summary = service.run_manual(None).await.expect("run");
        assert_eq!(summary.events_found, 2);
        assert_eq!(summary.events_forwarded, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.events_saved, 1);

        let payloads = executor.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].source, "riverside");
        assert_eq!(payloads[0].event_type, "event");
        let event = &payloads[0].events[0];
        assert_eq!(event.start_date.to_string(), "2024-06-15");
        assert_eq!(event.start_time.as_deref(), Some("7:00pm"));
        assert_eq!(event.price, Price::Fixed(45.0));
        assert_eq!(event.dedup_key, "https://x/y");
        assert_eq!(event.extraction_method, ExtractionMethod::CssSelector);

        let job = service.jobs().get(summary.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.events_found, job.events_saved), (2, 1));
        assert!(!service.run_lock().is_running());
    }

    #[tokio::test]
    async fn repeat_run_is_suppressed_by_the_store() {
        let mut pages = FixturePages::default();
        pages.by_source.insert("riverside".into(), vec![jazz(None)]);
        let executor = Arc::new(RecordingExecutor::default());
        let service = service_with(pages, &["riverside"], executor.clone(), quick());

        assert_eq!(service.run_manual(None).await.unwrap().events_saved, 1);
        let second = service.run_manual(None).await.unwrap();
        assert_eq!(second.events_forwarded, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(executor.payloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_source_and_bad_records_do_not_fail_the_run() {
        let mut pages = FixturePages::default();
        let mut undated = jazz(None);
        undated.title = "Mystery Show".into();
        undated.date_text = Some("Coming soon".into());
        pages
            .by_source
            .insert("riverside".into(), vec![jazz(None), undated]);
        pages.failing.push("downtown".into());
        let executor = Arc::new(RecordingExecutor::default());
        let service = service_with(pages, &["riverside", "downtown"], executor, quick());

        let summary = service.run_manual(None).await.expect("run");
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.events_saved, 1);

        let job = service.jobs().get(summary.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rejected, 1);
        let downtown = job.sources.iter().find(|s| s.source_name == "downtown").unwrap();
        assert_eq!(
            downtown.error.as_deref(),
            Some("https://downtown.example/events unreachable")
        );
    }

    #[tokio::test]
    async fn total_submission_failure_fails_the_job() {
        let mut pages = FixturePages::default();
        pages.by_source.insert("riverside".into(), vec![jazz(None)]);
        let executor = Arc::new(RecordingExecutor {
            fail: true,
            ..Default::default()
        });
        let service = service_with(pages, &["riverside"], executor, quick());

        let err = service.run_manual(None).await.unwrap_err();
        assert!(matches!(err, CrawlError::SubmissionFailed { total: 1, .. }));
        let job = service.jobs().list().await.remove(0);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.sources.len(), 1);
        assert!(job.error.unwrap().contains("executor unreachable"));
        assert!(!service.run_lock().is_running());
    }

    #[tokio::test]
    async fn oversize_event_is_fatal() {
        let mut pages = FixturePages::default();
        let mut huge = jazz(None);
        huge.description_text = Some("x ".repeat(200_000));
        pages.by_source.insert("riverside".into(), vec![huge]);
        let executor = Arc::new(RecordingExecutor::default());
        let service = service_with(pages, &["riverside"], executor.clone(), quick());

        let err = service.run_manual(None).await.unwrap_err();
        assert!(matches!(err, CrawlError::Oversize(BatchError::Oversize { .. })));
        assert!(executor.payloads.lock().unwrap().is_empty());
        let claim = service.store().get("jazz night::2024-06-15").await.unwrap();
        assert!(claim.is_none());
    }

    #[tokio::test]
    async fn undelivered_events_are_forwarded_by_the_next_run() {
        let mut pages = FixturePages::default();
        pages.by_source.insert("riverside".into(), vec![jazz(None)]);
        let executor = Arc::new(RecordingExecutor {
            failures_left: AtomicUsize::new(1),
            ..Default::default()
        });
        let service = service_with(pages, &["riverside"], executor.clone(), quick());

        let err = service.run_manual(None).await.unwrap_err();
        assert!(matches!(err, CrawlError::SubmissionFailed { total: 1, .. }));
        let claim = service.store().get("jazz night::2024-06-15").await.unwrap();
        assert!(claim.is_none());

        let retry = service.run_manual(None).await.expect("second run");
        assert_eq!(retry.duplicates, 0);
        assert_eq!(retry.events_forwarded, 1);
        assert_eq!(retry.events_saved, 1);
        assert_eq!(executor.payloads.lock().unwrap().len(), 1);

        let third = service.run_manual(None).await.expect("third run");
        assert_eq!(third.events_forwarded, 0);
        assert_eq!(third.duplicates, 1);
    }

    #[tokio::test]
    async fn repeated_source_names_are_crawled_and_submitted_once() {
        let mut pages = FixturePages::default();
        pages.by_source.insert("riverside".into(), vec![jazz(None)]);
        let executor = Arc::new(RecordingExecutor::default());
        let options = RunOptions {
            cross_run_dedup: false,
            ..quick()
        };
        let service = service_with(pages, &["riverside"], executor.clone(), options);

        let summary = service
            .run_manual(Some(vec!["riverside".into(), "riverside".into()]))
            .await
            .expect("run");
        assert_eq!(summary.sources, ["riverside"]);
        assert_eq!(summary.events_found, 1);
        assert_eq!(summary.events_saved, 1);
        assert_eq!(summary.batches_submitted, 1);
        assert_eq!(executor.payloads.lock().unwrap().len(), 1);

        let job = service.jobs().get(summary.job_id).await.unwrap();
        assert_eq!(job.sources.len(), 1);
    }

    #[tokio::test]
    async fn source_progress_is_visible_while_later_sources_run() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let mut pages = FixturePages {
            gate: Some((started.clone(), release.clone())),
            gated_source: Some("second".into()),
            ..Default::default()
        };
        pages.by_source.insert("first".into(), vec![jazz(None)]);
        pages.failing.push("broken".into());
        let service = Arc::new(service_with(
            pages,
            &["first", "broken", "second"],
            Arc::new(RecordingExecutor::default()),
            quick(),
        ));

        let run = tokio::spawn({
            let service = service.clone();
            async move { service.run_manual(None).await }
        });
        started.notified().await;

        let job = service.jobs().list().await.remove(0);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.events_found, 1);
        let names: Vec<_> = job.sources.iter().map(|s| s.source_name.as_str()).collect();
        assert_eq!(names, ["first", "broken"]);
        assert!(job.sources[1].error.is_some());

        release.notify_one();
        let summary = run.await.unwrap().expect("run");
        let job = service.jobs().get(summary.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.sources.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn politeness_delay_spaces_out_sequential_sources() {
        let mut pages = FixturePages::default();
        for name in ["first", "second", "third"] {
            pages.by_source.insert(name.into(), vec![jazz(None)]);
        }
        let options = RunOptions {
            politeness_delay: Duration::from_secs(2),
            source_concurrency: 1,
            cross_run_dedup: false,
            ..RunOptions::default()
        };
        let service = service_with(
            pages,
            &["first", "second", "third"],
            Arc::new(RecordingExecutor::default()),
            options,
        );

        let began = Instant::now();
        service.run_manual(None).await.expect("run");
        let elapsed = began.elapsed();
        assert!(elapsed >= Duration::from_secs(4), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn unknown_sources_are_rejected_before_any_job() {
        let service = service_with(
            FixturePages::default(),
            &["riverside"],
            Arc::new(RecordingExecutor::default()),
            quick(),
        );
        let err = service
            .run_manual(Some(vec!["riverside".into(), "nowhere".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::UnknownSources(ref names) if names == &["nowhere"]));
        assert!(service.jobs().list().await.is_empty());
    }

    #[tokio::test]
    async fn second_run_is_rejected_while_first_is_in_flight() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let mut pages = FixturePages {
            gate: Some((started.clone(), release.clone())),
            ..Default::default()
        };
        pages.by_source.insert("riverside".into(), vec![jazz(None)]);
        let service = Arc::new(service_with(
            pages,
            &["riverside"],
            Arc::new(RecordingExecutor::default()),
            quick(),
        ));

        let first = tokio::spawn({
            let service = service.clone();
            async move { service.run_manual(None).await }
        });
        started.notified().await;

        let before = service.jobs().list().await;
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].status, JobStatus::Running);

        let err = service.run_manual(None).await.unwrap_err();
        assert!(matches!(err, CrawlError::AlreadyRunning));
        assert_eq!(service.jobs().list().await, before);

        release.notify_one();
        let summary = first.await.unwrap().expect("first run");
        assert_eq!(summary.events_saved, 1);
        assert!(!service.run_lock().is_running());
    }

    #[tokio::test]
    async fn deadline_skips_remaining_sources_and_fails_as_timeout() {
        let mut pages = FixturePages::default();
        pages.by_source.insert("first".into(), vec![jazz(None)]);
        pages.hang.push("second".into());
        let executor = Arc::new(RecordingExecutor::default());
        let options = RunOptions {
            deadline: Some(Duration::from_millis(200)),
            ..quick()
        };
        let service = service_with(pages, &["first", "second", "third"], executor.clone(), options);

        let err = service.run_manual(None).await.unwrap_err();
        assert!(err.is_timeout());
        match &err {
            CrawlError::DeadlineExceeded { skipped_sources, .. } => {
                assert_eq!(skipped_sources, &["second", "third"]);
            }
            other => panic!("unexpected {other}"),
        }

        // Events collected before the deadline are still delivered.
        assert_eq!(executor.payloads.lock().unwrap().len(), 1);
        let job = service.jobs().list().await.remove(0);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.events_saved, 1);
        assert!(job.error.unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn from_config_wires_file_store_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        let sources_file = dir.path().join("sources.yaml");
        std::fs::write(
            &sources_file,
            "sources:\n  - name: riverside\n    base_url: https://riverside.example\n",
        )
        .unwrap();
        let config = SyncConfig {
            sources_file,
            store_dir: dir.path().join("store"),
            ..SyncConfig::default()
        };
        let service = CrawlService::from_config(&config).expect("service");
        assert_eq!(service.registry().enabled_names(), ["riverside"]);
        assert!(service.store().get("missing").await.unwrap().is_none());

        let missing = SyncConfig {
            sources_file: dir.path().join("absent.yaml"),
            ..SyncConfig::default()
        };
        let err = CrawlService::from_config(&missing).err().expect("missing registry");
        assert!(format!("{err:#}").contains("absent.yaml"));
    }
}
