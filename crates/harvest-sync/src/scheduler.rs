use std::sync::Arc;

use anyhow::{Context, Result};
use harvest_adapters::ScheduleBucket;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::service::{CrawlError, CrawlService};

/// One cron job per schedule bucket. Returns `None` when scheduling is disabled.
///
/// A trigger that lands while another run holds the lock is skipped, not queued.
pub async fn maybe_build_scheduler(
    service: Arc<CrawlService>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for bucket in ScheduleBucket::ALL {
        let cron = config.cron_for(bucket);
        let service = service.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                match service.run_bucket(bucket).await {
                    Ok(summary) => info!(
                        %bucket,
                        job_id = %summary.job_id,
                        saved = summary.events_saved,
                        "scheduled crawl finished"
                    ),
                    Err(CrawlError::AlreadyRunning) => {
                        warn!(%bucket, "scheduled crawl skipped; another run in progress")
                    }
                    Err(err) => error!(%bucket, error = %err, "scheduled crawl failed"),
                }
            })
        })
        .with_context(|| format!("creating {bucket} scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%bucket, cron, "scheduler job registered");
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::StoreWorkflowExecutor;
    use crate::service::RunOptions;
    use harvest_adapters::{ExtractionEngine, HttpPageAutomation, SourceRegistry, StrategyConfig};
    use harvest_storage::{HttpClientConfig, HttpFetcher, InMemoryEventStore};

    fn service() -> Arc<CrawlService> {
        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let engine = ExtractionEngine::new(
            Arc::new(HttpPageAutomation::new(fetcher)),
            None,
            StrategyConfig::default(),
        );
        let store = Arc::new(InMemoryEventStore::new());
        Arc::new(CrawlService::new(
            Arc::new(SourceRegistry::default()),
            Arc::new(engine),
            store.clone(),
            Arc::new(StoreWorkflowExecutor::new(store)),
            RunOptions::default(),
        ))
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let config = SyncConfig::default();
        let built = maybe_build_scheduler(service(), &config).await.unwrap();
        assert!(built.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_cron_is_reported() {
        let config = SyncConfig {
            scheduler_enabled: true,
            cron_weekly: "not a cron".into(),
            ..SyncConfig::default()
        };
        match maybe_build_scheduler(service(), &config).await {
            Ok(_) => panic!("invalid cron accepted"),
            Err(err) => assert!(format!("{err:#}").contains("weekly scheduler job")),
        }
    }
}
