//! Source adapters: per-site configuration, page and AI collaborator contracts,
//! and the extraction strategy engine that chooses between them.

mod ai;
mod page;
mod source;
mod strategy;

use std::time::Duration;

use harvest_storage::FetchError;
use thiserror::Error;

pub use ai::{decode_ai_response, AiExtraction, AiExtractor, HttpAiExtractor};
pub use page::{
    clean_page_text, extract_with_selectors, resolve_link, HttpPageAutomation, PageAutomation,
    PageHandle, MAX_PAGE_TEXT_CHARS,
};
pub use source::{ScheduleBucket, SelectorMap, SourceConfig, SourceRegistry};
pub use strategy::{
    AttemptOutcome, ExtractionEngine, PageExtraction, SourceExtraction, StrategyAttempt,
    StrategyConfig, DEFAULT_CONFIDENCE_THRESHOLD,
};

pub const CRATE_NAME: &str = "harvest-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("undecodable extraction response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },
    #[error("{0}")]
    Message(String),
}
