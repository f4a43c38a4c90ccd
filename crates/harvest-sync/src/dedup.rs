use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use harvest_core::{title_date_key, NormalizedEvent};
use harvest_storage::{EventStore, PutOutcome};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    New,
    /// A URL-bearing record replaced an earlier URL-less one for the same title and date.
    Upgraded { replaced_key: String },
    Duplicate,
}

#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub events: Vec<NormalizedEvent>,
    pub in_run_duplicates: usize,
    pub cross_run_duplicates: usize,
    /// Keys this run wrote to the store. Released again if their event is never delivered.
    pub claimed: Vec<String>,
}

impl DedupOutcome {
    pub fn duplicates(&self) -> usize {
        self.in_run_duplicates + self.cross_run_duplicates
    }
}

/// Run-scoped dedup registry with an optional conditional-write check against
/// the event store for cross-run suppression.
pub struct DedupEngine {
    store: Option<Arc<dyn EventStore>>,
    keys: HashSet<String>,
    by_title_date: HashMap<String, usize>,
    accepted: Vec<NormalizedEvent>,
    duplicates: usize,
}

impl DedupEngine {
    pub fn new(store: Option<Arc<dyn EventStore>>) -> Self {
        Self {
            store,
            keys: HashSet::new(),
            by_title_date: HashMap::new(),
            accepted: Vec::new(),
            duplicates: 0,
        }
    }

    pub fn is_duplicate(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn admit(&mut self, event: NormalizedEvent) -> Admission {
        if self.is_duplicate(&event.dedup_key) {
            debug!(dedup_key = %event.dedup_key, reason = "duplicate", "record skipped");
            self.duplicates += 1;
            return Admission::Duplicate;
        }

        let identity = title_date_key(&event.title, event.start_date);
        if let Some(&slot) = self.by_title_date.get(&identity) {
            let existing = &self.accepted[slot];
            if existing.detail_url.is_none() && event.detail_url.is_some() {
                let replaced_key = existing.dedup_key.clone();
                self.keys.remove(&replaced_key);
                self.keys.insert(event.dedup_key.clone());
                debug!(
                    dedup_key = %event.dedup_key,
                    replaced = %replaced_key,
                    "url-bearing record supersedes earlier copy"
                );
                self.accepted[slot] = event;
                self.duplicates += 1;
                return Admission::Upgraded { replaced_key };
            }
            debug!(dedup_key = %event.dedup_key, reason = "duplicate", "record skipped");
            self.duplicates += 1;
            return Admission::Duplicate;
        }

        self.keys.insert(event.dedup_key.clone());
        self.by_title_date.insert(identity, self.accepted.len());
        self.accepted.push(event);
        Admission::New
    }

    /// Applies the cross-run conditional write, when a store is attached, and
    /// returns the surviving events in admission order.
    ///
    /// A store failure keeps the event: the run-scoped registry already
    /// guarantees uniqueness within this run.
    pub async fn finish(self) -> DedupOutcome {
        let Some(store) = self.store else {
            return DedupOutcome {
                events: self.accepted,
                in_run_duplicates: self.duplicates,
                cross_run_duplicates: 0,
                claimed: Vec::new(),
            };
        };

        let mut events = Vec::with_capacity(self.accepted.len());
        let mut cross_run_duplicates = 0;
        let mut claimed = Vec::new();
        for event in self.accepted {
            match store.conditional_put(&event.dedup_key, &event).await {
                Ok(PutOutcome::Stored) => {
                    claimed.push(event.dedup_key.clone());
                    events.push(event);
                }
                Ok(PutOutcome::AlreadyExists) => {
                    debug!(dedup_key = %event.dedup_key, reason = "seen in earlier run", "record skipped");
                    cross_run_duplicates += 1;
                }
                Err(err) => {
                    warn!(dedup_key = %event.dedup_key, error = %err, "conditional write failed; forwarding anyway");
                    events.push(event);
                }
            }
        }
        info!(
            forwarded = events.len(),
            in_run = self.duplicates,
            cross_run = cross_run_duplicates,
            "dedup complete"
        );
        DedupOutcome {
            events,
            in_run_duplicates: self.duplicates,
            cross_run_duplicates,
            claimed,
        }
    }
}

/// Drops cross-run claims so the next run forwards those events again.
/// Returns how many keys were removed.
pub async fn release_claims<'a>(
    store: &dyn EventStore,
    keys: impl IntoIterator<Item = &'a str>,
) -> usize {
    let mut released = 0;
    for key in keys {
        match store.remove(key).await {
            Ok(true) => released += 1,
            Ok(false) => {}
            Err(err) => warn!(dedup_key = %key, error = %err, "could not release dedup claim"),
        }
    }
    if released > 0 {
        info!(released, "undelivered dedup claims released");
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use harvest_core::{dedup_key, ExtractionMethod, Price};
    use harvest_storage::InMemoryEventStore;

    fn event(title: &str, url: Option<&str>) -> NormalizedEvent {
        let start_date = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        NormalizedEvent {
            title: title.into(),
            start_date,
            end_date: None,
            start_time: Some("7:00pm".into()),
            price: Price::Fixed(45.0),
            location: None,
            venue: None,
            description: None,
            detail_url: url.map(Into::into),
            category: "Music".into(),
            source_name: "test".into(),
            dedup_key: dedup_key(url, title, Some(start_date)),
            extraction_method: ExtractionMethod::CssSelector,
            confidence: None,
        }
    }

    #[tokio::test]
    async fn same_record_twice_forwards_once() {
        let mut engine = DedupEngine::new(None);
        assert_eq!(engine.admit(event("Jazz Night", None)), Admission::New);
        assert_eq!(engine.admit(event("Jazz Night", None)), Admission::Duplicate);
        let outcome = engine.finish().await;
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.duplicates(), 1);
    }

    #[tokio::test]
    async fn url_record_upgrades_url_less_copy_in_either_order() {
        let mut engine = DedupEngine::new(None);
        engine.admit(event("Jazz Night", None));
        assert_eq!(
            engine.admit(event("Jazz Night", Some("https://x/y"))),
            Admission::Upgraded {
                replaced_key: "jazz night::2024-06-15".into()
            }
        );
        assert!(engine.is_duplicate("https://x/y"));
        assert!(!engine.is_duplicate("jazz night::2024-06-15"));
        let outcome = engine.finish().await;
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].dedup_key, "https://x/y");

        let mut engine = DedupEngine::new(None);
        engine.admit(event("Jazz Night", Some("https://x/y")));
        assert_eq!(engine.admit(event("Jazz Night", None)), Admission::Duplicate);
        // Same title and date under a different URL: first URL stays canonical.
        assert_eq!(
            engine.admit(event("Jazz Night", Some("https://x/z"))),
            Admission::Duplicate
        );
        let outcome = engine.finish().await;
        assert_eq!(outcome.events[0].dedup_key, "https://x/y");
    }

    #[tokio::test]
    async fn store_backed_dedup_soft_skips_earlier_runs() {
        let store = Arc::new(InMemoryEventStore::new());

        let mut first = DedupEngine::new(Some(store.clone() as Arc<dyn EventStore>));
        first.admit(event("Jazz Night", Some("https://x/y")));
        first.admit(event("Blues Jam", None));
        let outcome = first.finish().await;
        assert_eq!(outcome.events.len(), 2);
        assert_eq!(store.len().await, 2);

        let mut second = DedupEngine::new(Some(store.clone() as Arc<dyn EventStore>));
        second.admit(event("Jazz Night", Some("https://x/y")));
        second.admit(event("Trivia", None));
        let outcome = second.finish().await;
        let titles: Vec<_> = outcome.events.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, ["Trivia"]);
        assert_eq!(outcome.cross_run_duplicates, 1);
        assert_eq!(outcome.in_run_duplicates, 0);
        assert_eq!(outcome.claimed, ["trivia::2024-06-15"]);
    }

    #[tokio::test]
    async fn released_claims_are_forwarded_by_the_next_run() {
        let store = Arc::new(InMemoryEventStore::new());

        let mut first = DedupEngine::new(Some(store.clone() as Arc<dyn EventStore>));
        first.admit(event("Jazz Night", Some("https://x/y")));
        first.admit(event("Blues Jam", None));
        let outcome = first.finish().await;
        assert_eq!(outcome.claimed.len(), 2);

        let released =
            release_claims(&*store, outcome.claimed.iter().map(String::as_str)).await;
        assert_eq!(released, 2);
        assert!(store.is_empty().await);

        let mut second = DedupEngine::new(Some(store.clone() as Arc<dyn EventStore>));
        second.admit(event("Jazz Night", Some("https://x/y")));
        let outcome = second.finish().await;
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.cross_run_duplicates, 0);
    }
}
