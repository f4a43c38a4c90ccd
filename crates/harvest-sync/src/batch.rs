//! Payload batcher: splits normalized events into batches whose serialized
//! workflow payload stays under the downstream byte limit.

use harvest_core::NormalizedEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Downstream executor rejects payloads above this many bytes.
pub const HARD_PAYLOAD_LIMIT: usize = 262_144;
pub const DEFAULT_PAYLOAD_MARGIN: usize = 260_000;
pub const DEFAULT_EVENT_TYPE: &str = "event";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowPayload {
    pub events: Vec<NormalizedEvent>,
    pub source: String,
    pub event_type: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PayloadRef<'a> {
    events: &'a [NormalizedEvent],
    source: &'a str,
    event_type: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub margin: usize,
    pub hard_limit: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self::with_margin(DEFAULT_PAYLOAD_MARGIN)
    }
}

impl BatchLimits {
    pub fn with_margin(margin: usize) -> Self {
        Self::new(margin, HARD_PAYLOAD_LIMIT)
    }

    /// The margin never exceeds the hard limit.
    pub fn new(margin: usize, hard_limit: usize) -> Self {
        Self {
            margin: margin.min(hard_limit),
            hard_limit,
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("event {dedup_key} serializes to {bytes} bytes alone, over the {limit} byte limit")]
    Oversize {
        dedup_key: String,
        bytes: usize,
        limit: usize,
    },
    #[error("serializing batch payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedBatch {
    pub id: String,
    pub index: usize,
    pub depth: u32,
    pub bytes: usize,
    pub payload: WorkflowPayload,
}

/// `{base}-{index}-{depth}-{8 hex chars}`.
pub fn batch_id(base: &str, index: usize, depth: u32) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{base}-{index}-{depth}-{}", &suffix[..8])
}

pub fn payload_size(
    events: &[NormalizedEvent],
    source: &str,
    event_type: &str,
) -> Result<usize, BatchError> {
    let payload = PayloadRef {
        events,
        source,
        event_type,
    };
    Ok(serde_json::to_vec(&payload)?.len())
}

struct Splitter<'a> {
    source: &'a str,
    event_type: &'a str,
    base_name: &'a str,
    limits: BatchLimits,
    out: Vec<PlannedBatch>,
}

impl Splitter<'_> {
    fn emit(&mut self, events: &[NormalizedEvent], index: usize, depth: u32, bytes: usize) {
        let id = batch_id(self.base_name, index, depth);
        debug!(batch_id = %id, events = events.len(), bytes, depth, "batch planned");
        self.out.push(PlannedBatch {
            id,
            index,
            depth,
            bytes,
            payload: WorkflowPayload {
                events: events.to_vec(),
                source: self.source.to_string(),
                event_type: self.event_type.to_string(),
            },
        });
    }

    fn bisect(&mut self, chunk: &[NormalizedEvent], index: usize, depth: u32) -> Result<(), BatchError> {
        let bytes = payload_size(chunk, self.source, self.event_type)?;
        if bytes <= self.limits.hard_limit {
            self.emit(chunk, index, depth, bytes);
            return Ok(());
        }
        if let [single] = chunk {
            return Err(BatchError::Oversize {
                dedup_key: single.dedup_key.clone(),
                bytes,
                limit: self.limits.hard_limit,
            });
        }
        let mid = chunk.len() / 2;
        info!(
            index,
            depth,
            bytes,
            events = chunk.len(),
            limit = self.limits.hard_limit,
            "chunk over hard limit; bisecting"
        );
        self.bisect(&chunk[..mid], index, depth + 1)?;
        self.bisect(&chunk[mid..], index, depth + 1)
    }
}

/// Partitions `events` into payloads that each serialize to at most
/// `limits.hard_limit` bytes, preserving order. A single event too large to
/// fit on its own is an error.
pub fn split_to_fit(
    events: &[NormalizedEvent],
    source: &str,
    event_type: &str,
    base_name: &str,
    limits: BatchLimits,
) -> Result<Vec<PlannedBatch>, BatchError> {
    let mut splitter = Splitter {
        source,
        event_type,
        base_name,
        limits,
        out: Vec::new(),
    };
    if events.is_empty() {
        return Ok(splitter.out);
    }

    let total = payload_size(events, source, event_type)?;
    if total <= limits.margin {
        info!(source, events = events.len(), bytes = total, "payload fits in one batch");
        splitter.emit(events, 0, 0, total);
        return Ok(splitter.out);
    }

    let avg_event_size = total as f64 / events.len() as f64;
    let batch_size = ((limits.margin as f64 * 0.8) / avg_event_size).floor().max(1.0) as usize;
    info!(
        source,
        events = events.len(),
        bytes = total,
        batch_size,
        "payload over margin; chunking"
    );
    for (index, chunk) in events.chunks(batch_size).enumerate() {
        splitter.bisect(chunk, index, 0)?;
    }
    Ok(splitter.out)
}
