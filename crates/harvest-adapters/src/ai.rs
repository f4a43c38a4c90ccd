use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::RawEventRecord;
use harvest_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::json;

use crate::AdapterError;

/// Events an AI collaborator read out of page text, with its overall confidence.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct AiExtraction {
    #[serde(default)]
    pub events: Vec<RawEventRecord>,
    #[serde(default)]
    pub confidence: f64,
}

#[async_trait]
pub trait AiExtractor: Send + Sync {
    async fn extract(&self, page_text: &str, source_name: &str)
        -> Result<AiExtraction, AdapterError>;
}

/// Posts page text to an extraction endpoint that answers with
/// `{"events": [...], "confidence": 0.0..1.0}`.
#[derive(Debug, Clone)]
pub struct HttpAiExtractor {
    fetcher: Arc<HttpFetcher>,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpAiExtractor {
    pub fn new(
        fetcher: Arc<HttpFetcher>,
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
            token,
            timeout,
        }
    }
}

#[async_trait]
impl AiExtractor for HttpAiExtractor {
    async fn extract(
        &self,
        page_text: &str,
        source_name: &str,
    ) -> Result<AiExtraction, AdapterError> {
        let body = json!({
            "pageText": page_text,
            "sourceName": source_name,
            "instructions": "Extract every upcoming event on this page. Return title, date, time, price, location, venue, description, url and category as written on the page, plus an overall confidence between 0 and 1.",
        });
        let response = self
            .fetcher
            .post_json(
                source_name,
                &self.endpoint,
                &body,
                self.token.as_deref(),
                Some(self.timeout),
            )
            .await?;
        decode_ai_response(&response.body)
    }
}

/// Parses the collaborator's reply, clamping confidence into `0.0..=1.0`.
pub fn decode_ai_response(body: &[u8]) -> Result<AiExtraction, AdapterError> {
    let mut extraction: AiExtraction = serde_json::from_slice(body)?;
    extraction.confidence = if extraction.confidence.is_finite() {
        extraction.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Ok(extraction)
}
