//! Extraction strategy engine.
//!
//! Per page the engine walks three steps, each independently fault tolerant:
//!
//! 1. AI-first, accepted only at or above the confidence threshold with at least one event.
//! 2. Selector extraction, accepted on any non-empty result.
//! 3. AI fallback, accepted regardless of confidence.
//!
//! A failing step is logged and recorded in [`PageExtraction::attempts`], and
//! the walk moves on. When nothing is accepted the page yields zero records.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use harvest_core::{ExtractionMethod, RawEventRecord};
use tracing::{info, info_span, warn, Instrument};
use url::Url;

use crate::ai::AiExtractor;
use crate::page::{resolve_link, PageAutomation, PageHandle, MAX_PAGE_TEXT_CHARS};
use crate::source::SourceConfig;
use crate::AdapterError;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub ai_first: bool,
    pub confidence_threshold: f64,
    pub page_timeout: Duration,
    pub ai_timeout: Duration,
    pub max_page_text: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            ai_first: true,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            page_timeout: Duration::from_secs(30),
            ai_timeout: Duration::from_secs(60),
            max_page_text: MAX_PAGE_TEXT_CHARS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Accepted { events: usize },
    Empty,
    BelowThreshold { confidence: f64, events: usize },
    Failed(String),
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted { events } => write!(f, "accepted {events} events"),
            Self::Empty => f.write_str("no events"),
            Self::BelowThreshold { confidence, events } => {
                write!(f, "confidence {confidence:.2} below threshold ({events} events)")
            }
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyAttempt {
    pub method: ExtractionMethod,
    pub outcome: AttemptOutcome,
}

/// Result for one page. `method` is `None` when no step produced events.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageExtraction {
    pub url: String,
    pub method: Option<ExtractionMethod>,
    pub confidence: Option<f64>,
    pub records: Vec<RawEventRecord>,
    pub attempts: Vec<StrategyAttempt>,
    pub error: Option<String>,
}

/// Aggregate over every configured URL of one source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceExtraction {
    pub source_name: String,
    pub pages: Vec<PageExtraction>,
}

impl SourceExtraction {
    pub fn record_count(&self) -> usize {
        self.pages.iter().map(|p| p.records.len()).sum()
    }

    /// First page-level error, when every page failed.
    pub fn failure(&self) -> Option<String> {
        if !self.pages.is_empty() && self.pages.iter().all(|p| p.error.is_some()) {
            self.pages.iter().find_map(|p| p.error.clone())
        } else {
            None
        }
    }
}

async fn within<T, F>(limit: Duration, step: &'static str, fut: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| AdapterError::Timeout { step, after: limit })?
}

pub struct ExtractionEngine {
    pages: Arc<dyn PageAutomation>,
    ai: Option<Arc<dyn AiExtractor>>,
    config: StrategyConfig,
}

impl ExtractionEngine {
    pub fn new(
        pages: Arc<dyn PageAutomation>,
        ai: Option<Arc<dyn AiExtractor>>,
        config: StrategyConfig,
    ) -> Self {
        Self { pages, ai, config }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn ai_enabled(&self) -> bool {
        self.ai.is_some()
    }

    pub async fn extract_source(&self, source: &SourceConfig) -> SourceExtraction {
        let mut pages = Vec::with_capacity(source.event_urls.len());
        for url in &source.event_urls {
            pages.push(self.extract_page(source, url).await);
        }
        SourceExtraction {
            source_name: source.name.clone(),
            pages,
        }
    }

    pub async fn extract_page(&self, source: &SourceConfig, url: &str) -> PageExtraction {
        let span = info_span!("extract_page", source = %source.name, url);
        async {
            let navigated = within(
                self.config.page_timeout,
                "navigate",
                self.pages.navigate(&source.name, url),
            )
            .await;
            match navigated {
                Ok(page) => self.run_strategies(source, &page).await,
                Err(err) => {
                    warn!(error = %err, "navigation failed; source page contributes no events");
                    PageExtraction {
                        url: url.to_string(),
                        error: Some(err.to_string()),
                        ..Default::default()
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Runs the step sequence over an already loaded page.
    pub async fn run_strategies(&self, source: &SourceConfig, page: &PageHandle) -> PageExtraction {
        let mut result = PageExtraction {
            url: page.url.clone(),
            ..Default::default()
        };
        let page_text = self
            .ai
            .as_ref()
            .map(|_| page.text(self.config.max_page_text));

        if let (Some(ai), Some(text), true) = (&self.ai, &page_text, self.config.ai_first) {
            let method = ExtractionMethod::AiAgent;
            match within(self.config.ai_timeout, "ai", ai.extract(text, &source.name)).await {
                Ok(found) if found.events.is_empty() => {
                    result.note(method, AttemptOutcome::Empty);
                }
                Ok(found) if found.confidence >= self.config.confidence_threshold => {
                    return result.accept(source, page, method, Some(found.confidence), found.events);
                }
                Ok(found) => {
                    result.note(
                        method,
                        AttemptOutcome::BelowThreshold {
                            confidence: found.confidence,
                            events: found.events.len(),
                        },
                    );
                }
                Err(err) => result.note(method, AttemptOutcome::Failed(err.to_string())),
            }
        }

        let method = ExtractionMethod::CssSelector;
        match within(
            self.config.page_timeout,
            "selectors",
            self.pages.extract_via_selectors(page, source),
        )
        .await
        {
            Ok(records) if !records.is_empty() => {
                return result.accept(source, page, method, None, records);
            }
            Ok(_) => result.note(method, AttemptOutcome::Empty),
            Err(err) => result.note(method, AttemptOutcome::Failed(err.to_string())),
        }

        if let (Some(ai), Some(text)) = (&self.ai, &page_text) {
            let method = ExtractionMethod::AiFallback;
            match within(self.config.ai_timeout, "ai", ai.extract(text, &source.name)).await {
                Ok(found) if !found.events.is_empty() => {
                    return result.accept(source, page, method, Some(found.confidence), found.events);
                }
                Ok(_) => result.note(method, AttemptOutcome::Empty),
                Err(err) => result.note(method, AttemptOutcome::Failed(err.to_string())),
            }
        }

        warn!(attempts = result.attempts.len(), "no extraction step produced events");
        result
    }
}

impl PageExtraction {
    fn note(&mut self, method: ExtractionMethod, outcome: AttemptOutcome) {
        match &outcome {
            AttemptOutcome::Failed(_) => {
                warn!(method = %method, reason = %outcome, "extraction step failed")
            }
            _ => info!(method = %method, reason = %outcome, "extraction step rejected"),
        }
        self.attempts.push(StrategyAttempt { method, outcome });
    }

    fn accept(
        mut self,
        source: &SourceConfig,
        page: &PageHandle,
        method: ExtractionMethod,
        confidence: Option<f64>,
        records: Vec<RawEventRecord>,
    ) -> Self {
        let base = Url::parse(&page.url).ok();
        let events = records.len();
        self.records = records
            .into_iter()
            .map(|mut record| {
                record.extraction_method = method;
                record.source_name = source.name.clone();
                record.detail_url = record
                    .detail_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|href| !href.is_empty())
                    .map(|href| resolve_link(base.as_ref(), href));
                record
            })
            .collect();
        info!(method = %method, confidence, events, "extraction accepted");
        self.attempts.push(StrategyAttempt {
            method,
            outcome: AttemptOutcome::Accepted { events },
        });
        self.method = Some(method);
        self.confidence = confidence;
        self
    }
}
