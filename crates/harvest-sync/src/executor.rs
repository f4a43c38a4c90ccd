use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use harvest_storage::{EventStore, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::batch::{PlannedBatch, WorkflowPayload};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHandle {
    pub batch_id: String,
    pub execution_id: String,
}

/// Downstream workflow that validates and persists a batch.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    async fn submit(&self, batch_id: &str, payload: &WorkflowPayload) -> Result<ExecutionHandle>;
}

/// Starts a remote workflow execution per batch via a JSON POST.
#[derive(Debug, Clone)]
pub struct HttpWorkflowExecutor {
    fetcher: Arc<HttpFetcher>,
    endpoint: String,
    token: Option<String>,
}

impl HttpWorkflowExecutor {
    pub fn new(fetcher: Arc<HttpFetcher>, endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
            token,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartExecutionResponse {
    #[serde(alias = "executionArn", alias = "id")]
    execution_id: Option<String>,
}

#[async_trait]
impl WorkflowExecutor for HttpWorkflowExecutor {
    async fn submit(&self, batch_id: &str, payload: &WorkflowPayload) -> Result<ExecutionHandle> {
        let body = json!({ "name": batch_id, "input": payload });
        let response = self
            .fetcher
            .post_json("workflow", &self.endpoint, &body, self.token.as_deref(), None)
            .await
            .with_context(|| format!("submitting batch {batch_id} to {}", self.endpoint))?;
        let execution_id = serde_json::from_slice::<StartExecutionResponse>(&response.body)
            .ok()
            .and_then(|r| r.execution_id)
            .unwrap_or_else(|| batch_id.to_string());
        Ok(ExecutionHandle {
            batch_id: batch_id.to_string(),
            execution_id,
        })
    }
}

/// Local stand-in for the remote workflow: upserts every event into the store.
#[derive(Clone)]
pub struct StoreWorkflowExecutor {
    store: Arc<dyn EventStore>,
}

impl StoreWorkflowExecutor {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl WorkflowExecutor for StoreWorkflowExecutor {
    async fn submit(&self, batch_id: &str, payload: &WorkflowPayload) -> Result<ExecutionHandle> {
        for event in &payload.events {
            self.store
                .put(&event.dedup_key, event)
                .await
                .with_context(|| format!("persisting {} from batch {batch_id}", event.dedup_key))?;
        }
        Ok(ExecutionHandle {
            batch_id: batch_id.to_string(),
            execution_id: format!("local-{batch_id}"),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub submitted: Vec<ExecutionHandle>,
    /// `(batch id, error)` per failed submission.
    pub failed: Vec<(String, String)>,
    /// Batch ids never attempted because the run deadline passed.
    pub skipped: Vec<String>,
    pub events_submitted: usize,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.submitted.len() + self.failed.len()
    }

    pub fn all_failed(&self) -> bool {
        !self.failed.is_empty() && self.submitted.is_empty()
    }
}

/// Submits batches one at a time. A failed batch does not stop later ones.
/// Once `deadline` passes, remaining batches are skipped; a submission already
/// in flight is allowed to finish.
pub async fn deliver(
    executor: &dyn WorkflowExecutor,
    batches: &[PlannedBatch],
    deadline: Option<Instant>,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for batch in batches {
        if deadline.is_some_and(|at| Instant::now() >= at) {
            report.skipped.push(batch.id.clone());
            continue;
        }
        match executor.submit(&batch.id, &batch.payload).await {
            Ok(handle) => {
                info!(
                    batch_id = %batch.id,
                    execution_id = %handle.execution_id,
                    events = batch.payload.events.len(),
                    bytes = batch.bytes,
                    "batch submitted"
                );
                report.events_submitted += batch.payload.events.len();
                report.submitted.push(handle);
            }
            Err(err) => {
                warn!(batch_id = %batch.id, error = %format!("{err:#}"), "batch submission failed");
                report.failed.push((batch.id.clone(), format!("{err:#}")));
            }
        }
    }
    if !report.skipped.is_empty() {
        warn!(skipped = report.skipped.len(), "deadline reached; remaining batches not submitted");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{split_to_fit, BatchLimits};
    use chrono::NaiveDate;
    use harvest_core::{ExtractionMethod, NormalizedEvent, Price};
    use harvest_storage::InMemoryEventStore;
    use std::sync::Mutex;

    fn event(i: usize) -> NormalizedEvent {
        NormalizedEvent {
            title: format!("Event {i}"),
            start_date: NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
            end_date: None,
            start_time: None,
            price: Price::Free,
            location: None,
            venue: None,
            description: Some("y".repeat(500)),
            detail_url: None,
            category: "Music".into(),
            source_name: "test".into(),
            dedup_key: format!("event {i}::2024-06-15"),
            extraction_method: ExtractionMethod::CssSelector,
            confidence: None,
        }
    }

    /// Fails every batch whose index is listed.
    struct FlakyExecutor {
        fail_indexes: Vec<usize>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkflowExecutor for FlakyExecutor {
        async fn submit(&self, batch_id: &str, _payload: &WorkflowPayload) -> Result<ExecutionHandle> {
            self.seen.lock().unwrap().push(batch_id.to_string());
            let index: usize = batch_id.split('-').nth(1).unwrap().parse().unwrap();
            if self.fail_indexes.contains(&index) {
                anyhow::bail!("workflow throttled");
            }
            Ok(ExecutionHandle {
                batch_id: batch_id.to_string(),
                execution_id: format!("exec-{index}"),
            })
        }
    }

    fn batches(n: usize) -> Vec<PlannedBatch> {
        let events: Vec<_> = (0..n).map(event).collect();
        split_to_fit(&events, "test", "event", "events", BatchLimits::new(3_000, 4_000)).unwrap()
    }

    #[tokio::test]
    async fn failures_do_not_stop_later_batches() {
        let planned = batches(20);
        assert!(planned.len() >= 3);
        let executor = FlakyExecutor {
            fail_indexes: vec![1],
            seen: Mutex::new(Vec::new()),
        };

        let report = deliver(&executor, &planned, None).await;
        assert_eq!(executor.seen.lock().unwrap().len(), planned.len());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].1, "workflow throttled");
        assert_eq!(report.attempted(), planned.len());
        assert!(!report.all_failed());
        let delivered: usize = planned
            .iter()
            .filter(|b| b.index != 1)
            .map(|b| b.payload.events.len())
            .sum();
        assert_eq!(report.events_submitted, delivered);
    }

    #[tokio::test]
    async fn passed_deadline_skips_everything() {
        let planned = batches(10);
        let executor = FlakyExecutor {
            fail_indexes: Vec::new(),
            seen: Mutex::new(Vec::new()),
        };
        let report = deliver(&executor, &planned, Some(Instant::now())).await;
        assert_eq!(report.skipped.len(), planned.len());
        assert_eq!(report.attempted(), 0);
    }

    #[tokio::test]
    async fn store_executor_upserts_each_event() {
        let store = Arc::new(InMemoryEventStore::new());
        let executor = StoreWorkflowExecutor::new(store.clone());
        let report = deliver(&executor, &batches(6), None).await;
        assert_eq!(report.events_submitted, 6);
        assert!(report.submitted[0].execution_id.starts_with("local-events-"));
        assert_eq!(store.len().await, 6);
    }
}
