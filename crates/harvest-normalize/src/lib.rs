//! Field normalizers: free-text date, time, price and category strings into
//! canonical values, plus raw-to-normalized record conversion.
//!
//! Every parser is pure and reports failure as an absent value. Each one walks an
//! explicit, ordered matcher list ([`DATE_MATCHERS`], [`TIME_MATCHERS`]) so the
//! priority order can be inspected and tested directly.

mod category;
mod date;
mod price;
mod time;

use std::collections::BTreeMap;

use chrono::NaiveDate;
use harvest_core::{dedup_key, NormalizedEvent, RawEventRecord};
use thiserror::Error;
use tracing::debug;

pub use category::{map_category, DEFAULT_CATEGORY_KEYWORDS, UNCATEGORIZED};
pub use date::{
    infer_year, match_date, parse_date, parse_date_on, parse_date_range, parse_date_range_on,
    parse_with_hints, today_local, DateMatcher, DateRange, DATE_MATCHERS,
};
pub use price::parse_price;
pub use time::{match_time, parse_time, TimeMatcher, TIME_MATCHERS};

pub const CRATE_NAME: &str = "harvest-normalize";

/// Per-source hints consulted during normalization.
#[derive(Debug, Clone, Copy)]
pub struct SourceHints<'a> {
    pub date_formats: &'a [String],
    pub category_mapping: Option<&'a BTreeMap<String, String>>,
}

impl SourceHints<'_> {
    pub const NONE: SourceHints<'static> = SourceHints {
        date_formats: &[],
        category_mapping: None,
    };
}

/// Why a raw record never became a normalized event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("record has no title")]
    MissingTitle,
    #[error("record has no date text")]
    MissingDate,
    #[error("unparseable date {0:?}")]
    UnparseableDate(String),
    #[error("unparseable time {0:?}")]
    UnparseableTime(String),
}

pub fn normalize_record(
    raw: &RawEventRecord,
    hints: SourceHints<'_>,
    confidence: Option<f64>,
) -> Result<NormalizedEvent, RejectReason> {
    normalize_record_on(raw, hints, confidence, today_local())
}

/// Builds a [`NormalizedEvent`] from a raw record. `confidence` is kept only for
/// AI-extracted records.
pub fn normalize_record_on(
    raw: &RawEventRecord,
    hints: SourceHints<'_>,
    confidence: Option<f64>,
    today: NaiveDate,
) -> Result<NormalizedEvent, RejectReason> {
    let title = clean_text(Some(&raw.title)).ok_or(RejectReason::MissingTitle)?;

    let date_text = clean_text(raw.date_text.as_deref()).ok_or(RejectReason::MissingDate)?;
    // Source formats are authoritative, so they are tried before range detection.
    let hinted = parse_with_hints(&date_text, hints.date_formats, today);
    let (start_date, end_date) = match (hinted, parse_date_range_on(&date_text, today)) {
        (Some(date), _) => {
            debug!(matcher = "hint", %date, "date matched");
            (date, None)
        }
        (None, Some(range)) if range.end > range.start => (range.start, Some(range.end)),
        (None, Some(range)) => (range.start, None),
        (None, None) => {
            let (matcher, date) = match_date(&date_text, &[], today)
                .ok_or_else(|| RejectReason::UnparseableDate(date_text.clone()))?;
            debug!(matcher, %date, "date matched");
            (date, None)
        }
    };

    let start_time = match clean_text(raw.time_text.as_deref()) {
        None => None,
        Some(text) => match parse_time(&text) {
            Some(t) => Some(t),
            // "TBA" and "All day" carry no clock time; only digit-bearing text is a failure.
            None if text.chars().any(|c| c.is_ascii_digit()) => {
                return Err(RejectReason::UnparseableTime(text))
            }
            None => None,
        },
    };

    let price = parse_price(raw.price_text.as_deref().unwrap_or_default());
    let category = map_category(
        raw.category_text.as_deref().unwrap_or_default(),
        hints.category_mapping,
    );
    let detail_url = clean_text(raw.detail_url.as_deref());
    let key = dedup_key(detail_url.as_deref(), &title, Some(start_date));
    let confidence = if raw.extraction_method.is_ai() {
        confidence.map(|c| c.clamp(0.0, 1.0))
    } else {
        None
    };

    Ok(NormalizedEvent {
        title,
        start_date,
        end_date,
        start_time,
        price,
        location: clean_text(raw.location_text.as_deref()),
        venue: clean_text(raw.venue_text.as_deref()),
        description: clean_text(raw.description_text.as_deref()),
        detail_url,
        category,
        source_name: raw.source_name.clone(),
        dedup_key: key,
        extraction_method: raw.extraction_method,
        confidence,
    })
}

/// Trims and collapses inner whitespace; empty text becomes `None`.
pub fn clean_text(value: Option<&str>) -> Option<String> {
    let joined = value?.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}
