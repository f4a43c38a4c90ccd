//! Core domain model for the event harvester.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-core";

/// Which extraction strategy produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExtractionMethod {
    #[default]
    #[serde(rename = "css-selector")]
    CssSelector,
    #[serde(rename = "ai-agent")]
    AiAgent,
    #[serde(rename = "ai-fallback")]
    AiFallback,
}

impl ExtractionMethod {
    pub fn is_ai(self) -> bool {
        matches!(self, Self::AiAgent | Self::AiFallback)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CssSelector => "css-selector",
            Self::AiAgent => "ai-agent",
            Self::AiFallback => "ai-fallback",
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one extraction attempt on one source page. Nothing is normalized yet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEventRecord {
    pub title: String,
    #[serde(default, alias = "date")]
    pub date_text: Option<String>,
    #[serde(default, alias = "time")]
    pub time_text: Option<String>,
    #[serde(default, alias = "price")]
    pub price_text: Option<String>,
    #[serde(default, alias = "location")]
    pub location_text: Option<String>,
    #[serde(default, alias = "venue")]
    pub venue_text: Option<String>,
    #[serde(default, alias = "description")]
    pub description_text: Option<String>,
    #[serde(default, alias = "url")]
    pub detail_url: Option<String>,
    #[serde(default, alias = "category")]
    pub category_text: Option<String>,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub extraction_method: ExtractionMethod,
}

impl RawEventRecord {
    pub fn new(title: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            source_name: source_name.into(),
            ..Default::default()
        }
    }
}

/// Normalized ticket price. Serialized as `{"type": .., "amount": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "PriceRecord", try_from = "PriceRecord")]
pub enum Price {
    Free,
    Fixed(f64),
    Range { min: f64, max: f64 },
    Unparsed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceKind {
    Free,
    Fixed,
    Variable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriceAmount {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    #[serde(rename = "type")]
    pub kind: PriceKind,
    pub amount: PriceAmount,
}

impl Price {
    pub fn kind(&self) -> PriceKind {
        match self {
            Self::Free => PriceKind::Free,
            Self::Fixed(_) => PriceKind::Fixed,
            Self::Range { .. } | Self::Unparsed(_) => PriceKind::Variable,
        }
    }

    pub fn amount(&self) -> PriceAmount {
        match self {
            Self::Free => PriceAmount::Number(0.0),
            Self::Fixed(v) => PriceAmount::Number(*v),
            Self::Range { min, max } => {
                PriceAmount::Text(format!("{}-{}", format_amount(*min), format_amount(*max)))
            }
            Self::Unparsed(text) => PriceAmount::Text(text.clone()),
        }
    }
}

impl From<Price> for PriceRecord {
    fn from(price: Price) -> Self {
        PriceRecord {
            kind: price.kind(),
            amount: price.amount(),
        }
    }
}

impl TryFrom<PriceRecord> for Price {
    type Error = String;

    fn try_from(record: PriceRecord) -> Result<Self, Self::Error> {
        match (record.kind, record.amount) {
            (PriceKind::Free, _) => Ok(Price::Free),
            (PriceKind::Fixed, PriceAmount::Number(v)) => Ok(Price::Fixed(v)),
            (PriceKind::Fixed, PriceAmount::Text(t)) => t
                .trim()
                .parse::<f64>()
                .map(Price::Fixed)
                .map_err(|e| format!("fixed price amount {t:?}: {e}")),
            (PriceKind::Variable, PriceAmount::Number(v)) => Ok(Price::Unparsed(format_amount(v))),
            (PriceKind::Variable, PriceAmount::Text(t)) => {
                let parsed = t.split_once('-').and_then(|(lo, hi)| {
                    Some((lo.trim().parse::<f64>().ok()?, hi.trim().parse::<f64>().ok()?))
                });
                Ok(match parsed {
                    Some((min, max)) => Price::Range { min, max },
                    None => Price::Unparsed(t),
                })
            }
        }
    }
}

/// Renders `45.0` as `45` and `12.5` as `12.5`.
pub fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Canonical, store-ready event shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub title: String,
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    pub price: Price,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_url: Option<String>,
    pub category: String,
    pub source_name: String,
    pub dedup_key: String,
    pub extraction_method: ExtractionMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Stable identity for a record: the detail URL when present, else title plus start date.
pub fn dedup_key(detail_url: Option<&str>, title: &str, start_date: Option<NaiveDate>) -> String {
    if let Some(url) = detail_url.map(str::trim).filter(|u| !u.is_empty()) {
        return url.to_lowercase();
    }
    let date = start_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}::{}", title.trim().to_lowercase(), date)
}

/// Title-plus-date identity, independent of any detail URL.
pub fn title_date_key(title: &str, start_date: NaiveDate) -> String {
    dedup_key(None, title, Some(start_date))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Per-source outcome kept on the job for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceProgress {
    pub source_name: String,
    pub events_found: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tracked lifecycle of one scheduled or manual crawl run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlJob {
    pub id: Uuid,
    pub source_names: Vec<String>,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub events_found: usize,
    pub events_saved: usize,
    pub duplicates: usize,
    pub rejected: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub sources: Vec<SourceProgress>,
}

impl CrawlJob {
    pub fn new(source_names: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_names,
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            events_found: 0,
            events_saved: 0,
            duplicates: 0,
            rejected: 0,
            error: None,
            sources: Vec::new(),
        }
    }
}
