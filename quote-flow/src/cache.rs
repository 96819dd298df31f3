//! Reactive client-side cache of the last-known aggregate per quote number.
//!
//! Entries are replaced wholesale on every successful read or write; the
//! server always returns the complete aggregate, so no merging happens at
//! this layer. Concurrent writers resolve last-write-wins by arrival order.
//! Subscribers observe a monotonically increasing revision per quote number
//! and re-read on change, so every view of the same quote number converges
//! on the same value.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;

use crate::aggregate::QuoteAggregate;

/// Outcome of a cache read.
#[derive(Debug, Clone)]
pub enum CacheRead {
    /// Last value seen from the server.
    Fresh(QuoteAggregate),
    /// A fetch is in flight and no value has arrived yet.
    Pending,
    Absent,
}

impl CacheRead {
    pub fn into_aggregate(self) -> Option<QuoteAggregate> {
        match self {
            CacheRead::Fresh(aggregate) => Some(aggregate),
            _ => None,
        }
    }
}

struct Entry {
    aggregate: Option<QuoteAggregate>,
    fetched_at: Option<DateTime<Utc>>,
    in_flight: bool,
    revision: u64,
    notify: watch::Sender<u64>,
}

impl Entry {
    fn empty() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            aggregate: None,
            fetched_at: None,
            in_flight: false,
            revision: 0,
            notify,
        }
    }

    fn bump(&mut self) {
        self.revision += 1;
        // Receivers may all be gone; the entry outlives its subscribers.
        let _ = self.notify.send(self.revision);
    }
}

/// Single source of truth for quote aggregates on the client side.
#[derive(Clone)]
pub struct QuoteCache {
    entries: Arc<DashMap<String, Entry>>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn read(&self, quote_number: &str) -> CacheRead {
        match self.entries.get(quote_number) {
            Some(entry) => match (&entry.aggregate, entry.in_flight) {
                (Some(aggregate), _) => CacheRead::Fresh(aggregate.clone()),
                (None, true) => CacheRead::Pending,
                (None, false) => CacheRead::Absent,
            },
            None => CacheRead::Absent,
        }
    }

    /// Replace the entry wholesale with a server-returned aggregate.
    pub fn write(&self, quote_number: &str, aggregate: QuoteAggregate) {
        let mut entry = self
            .entries
            .entry(quote_number.to_string())
            .or_insert_with(Entry::empty);
        entry.aggregate = Some(aggregate);
        entry.fetched_at = Some(Utc::now());
        entry.in_flight = false;
        entry.bump();
    }

    /// Flag a fetch in flight. An existing value keeps serving reads.
    pub fn mark_pending(&self, quote_number: &str) {
        let mut entry = self
            .entries
            .entry(quote_number.to_string())
            .or_insert_with(Entry::empty);
        entry.in_flight = true;
        entry.bump();
    }

    /// Clear the in-flight flag without touching the value (fetch failed).
    pub fn clear_pending(&self, quote_number: &str) {
        if let Some(mut entry) = self.entries.get_mut(quote_number) {
            entry.in_flight = false;
            entry.bump();
        }
    }

    pub fn invalidate(&self, quote_number: &str) {
        if let Some(mut entry) = self.entries.get_mut(quote_number) {
            entry.aggregate = None;
            entry.fetched_at = None;
            entry.in_flight = false;
            entry.bump();
        }
    }

    pub fn is_pending(&self, quote_number: &str) -> bool {
        self.entries
            .get(quote_number)
            .map(|e| e.in_flight)
            .unwrap_or(false)
    }

    pub fn fetched_at(&self, quote_number: &str) -> Option<DateTime<Utc>> {
        self.entries.get(quote_number).and_then(|e| e.fetched_at)
    }

    /// Revision channel for the given quote number. Receivers re-read the
    /// cache on every change notification.
    pub fn subscribe(&self, quote_number: &str) -> watch::Receiver<u64> {
        self.entries
            .entry(quote_number.to_string())
            .or_insert_with(Entry::empty)
            .notify
            .subscribe()
    }
}

impl Default for QuoteCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::sample_aggregate;

    #[test]
    fn read_states() {
        let cache = QuoteCache::new();
        assert!(matches!(cache.read("DZ00000001"), CacheRead::Absent));

        cache.mark_pending("DZ00000001");
        assert!(matches!(cache.read("DZ00000001"), CacheRead::Pending));

        let aggregate = sample_aggregate("DZ00000001");
        cache.write("DZ00000001", aggregate.clone());
        match cache.read("DZ00000001") {
            CacheRead::Fresh(a) => assert_eq!(a.quote_number, "DZ00000001"),
            other => panic!("expected fresh, got {other:?}"),
        }

        cache.invalidate("DZ00000001");
        assert!(matches!(cache.read("DZ00000001"), CacheRead::Absent));
    }

    #[test]
    fn existing_value_keeps_serving_while_refetch_in_flight() {
        let cache = QuoteCache::new();
        cache.write("DZ00000002", sample_aggregate("DZ00000002"));
        cache.mark_pending("DZ00000002");
        assert!(cache.is_pending("DZ00000002"));
        assert!(matches!(cache.read("DZ00000002"), CacheRead::Fresh(_)));
        cache.clear_pending("DZ00000002");
        assert!(!cache.is_pending("DZ00000002"));
    }

    #[test]
    fn last_write_wins_and_all_readers_converge() {
        let cache = QuoteCache::new();
        let mut first = sample_aggregate("DZ00000003");
        first.premium = crate::aggregate::Premium::from_term_total(600.0);
        let mut second = sample_aggregate("DZ00000003");
        second.premium = crate::aggregate::Premium::from_term_total(720.0);

        cache.write("DZ00000003", first);
        cache.write("DZ00000003", second);

        for _ in 0..3 {
            let read = cache.read("DZ00000003").into_aggregate().unwrap();
            assert_eq!(read.premium.total, 720.0);
        }
    }

    #[tokio::test]
    async fn subscribers_observe_every_write() {
        let cache = QuoteCache::new();
        let mut rx = cache.subscribe("DZ00000004");
        let initial = *rx.borrow();

        cache.write("DZ00000004", sample_aggregate("DZ00000004"));
        rx.changed().await.unwrap();
        assert!(*rx.borrow() > initial);
    }
}
