//! Bounded in-memory history of captured requests.
//!
//! One `RwLock` covers both the ring buffer and the running statistics, so a
//! reader never sees a record without its statistics or the reverse.
//! Critical sections only touch memory; change notifications go out after
//! the lock is released.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::StoreSettings;
use crate::events::{ChangeStream, StoreEvent};
use crate::filter::RequestFilter;
use crate::models::{CapturedRequest, Statistics};
use crate::stats::StatsAccumulator;

/// Destination for requests parsed by the capture server
pub trait RequestSink: Send + Sync {
    fn deliver(&self, request: CapturedRequest);
}

struct StoreInner {
    ring: VecDeque<Arc<CapturedRequest>>,
    stats: StatsAccumulator,
    admitted: u64,
}

/// Thread-safe FIFO store with a hard resident cap
pub struct RequestStore {
    inner: RwLock<StoreInner>,
    capacity: usize,
    events: broadcast::Sender<StoreEvent>,
}

impl RequestStore {
    pub fn new(settings: &StoreSettings) -> Self {
        let capacity = settings.max_capacity.max(1);
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));

        Self {
            inner: RwLock::new(StoreInner {
                ring: VecDeque::with_capacity(capacity),
                stats: StatsAccumulator::new(settings),
                admitted: 0,
            }),
            capacity,
            events,
        }
    }

    pub fn with_capacity(max_capacity: usize) -> Self {
        Self::new(&StoreSettings {
            max_capacity,
            ..StoreSettings::default()
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a request, evicting the oldest resident when full.
    ///
    /// Returns the admission sequence number, which orders every admission
    /// this store has ever made.
    pub fn add(&self, request: CapturedRequest) -> u64 {
        let request = Arc::new(request);
        let id = request.id;

        let (sequence, evicted, resident) = {
            let mut inner = self.write();
            let evicted = if inner.ring.len() >= self.capacity {
                inner.ring.pop_front().map(|oldest| {
                    inner.stats.forget(&oldest);
                    oldest.id
                })
            } else {
                None
            };
            inner.stats.record(&request);
            inner.ring.push_back(request);
            inner.admitted += 1;
            (inner.admitted, evicted, inner.ring.len())
        };

        debug!(id, sequence, ?evicted, resident, "Admitted captured request");

        // No subscribers is not an error
        let _ = self.events.send(StoreEvent::Added {
            id,
            evicted,
            resident,
        });

        sequence
    }

    /// Matching residents in insertion order, as a point-in-time snapshot
    pub fn query(&self, filter: &RequestFilter) -> Vec<Arc<CapturedRequest>> {
        let snapshot: Vec<Arc<CapturedRequest>> = self.read().ring.iter().cloned().collect();

        if filter.is_empty() {
            return snapshot;
        }
        snapshot.into_iter().filter(|r| filter.matches(r)).collect()
    }

    pub fn get(&self, id: u64) -> Option<Arc<CapturedRequest>> {
        self.read().ring.iter().find(|r| r.id == id).cloned()
    }

    pub fn statistics_snapshot(&self) -> Statistics {
        self.read().stats.snapshot()
    }

    pub fn clear(&self) {
        let removed = {
            let mut inner = self.write();
            let removed = inner.ring.len();
            inner.ring.clear();
            inner.stats.reset();
            removed
        };

        info!(removed, "Cleared all stored requests");
        let _ = self.events.send(StoreEvent::Cleared);
    }

    pub fn count(&self) -> usize {
        self.read().ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn changes(&self) -> ChangeStream {
        ChangeStream::new(self.subscribe())
    }
}

impl RequestSink for RequestStore {
    fn deliver(&self, request: CapturedRequest) {
        self.add(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MultiMap;
    use chrono::Utc;

    fn request(id: u64, method: &str, path: &str) -> CapturedRequest {
        CapturedRequest {
            id,
            timestamp: Utc::now(),
            method: method.to_string(),
            path: path.to_string(),
            query_params: MultiMap::new(),
            headers: MultiMap::new(),
            headers_truncated: false,
            body: Vec::new(),
            truncated: false,
            client_address: "127.0.0.1".to_string(),
            content_length: id as usize,
            user_agent: "unknown".to_string(),
        }
    }

    fn ids(store: &RequestStore) -> Vec<u64> {
        store
            .query(&RequestFilter::default())
            .iter()
            .map(|r| r.id)
            .collect()
    }

    #[test]
    fn new_store_is_empty() {
        let store = RequestStore::with_capacity(10);
        assert_eq!(store.count(), 0);
        assert_eq!(store.capacity(), 10);
        assert!(store.query(&RequestFilter::default()).is_empty());
        assert_eq!(store.statistics_snapshot().total_count, 0);
    }

    #[test]
    fn eviction_is_fifo() {
        let store = RequestStore::with_capacity(3);
        for id in 1..=5 {
            store.add(request(id, "GET", "/"));
            assert!(store.count() <= 3);
        }

        assert_eq!(ids(&store), vec![3, 4, 5]);
        assert!(store.get(1).is_none());
        assert!(store.get(2).is_none());
        assert_eq!(store.get(4).unwrap().id, 4);
    }

    #[test]
    fn add_returns_increasing_sequence() {
        let store = RequestStore::with_capacity(2);
        let seqs: Vec<u64> = (1..=4).map(|id| store.add(request(id, "GET", "/"))).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn statistics_track_residents_only() {
        let store = RequestStore::with_capacity(2);
        store.add(request(1, "DELETE", "/old"));
        store.add(request(2, "GET", "/a"));
        store.add(request(3, "POST", "/a"));

        let stats = store.statistics_snapshot();
        assert_eq!(stats.total_count, store.count());
        assert!(!stats.count_by_method.contains_key("DELETE"));
        assert_eq!(stats.count_by_method.values().sum::<usize>(), stats.total_count);
        assert_eq!(stats.average_body_size, 2.5);
        assert_eq!(stats.top_paths[0].path, "/a");
        assert_eq!(stats.top_paths[0].count, 2);
    }

    #[test]
    fn query_applies_filter_in_insertion_order() {
        let store = RequestStore::with_capacity(10);
        store.add(request(1, "GET", "/api/users"));
        store.add(request(2, "POST", "/api/users"));
        store.add(request(3, "GET", "/health"));
        store.add(request(4, "GET", "/api/orders"));

        let filter = RequestFilter::new().method("get").path_contains("/api");
        let matched: Vec<u64> = store.query(&filter).iter().map(|r| r.id).collect();
        assert_eq!(matched, vec![1, 4]);
    }

    #[test]
    fn query_result_is_a_snapshot() {
        let store = RequestStore::with_capacity(10);
        store.add(request(1, "GET", "/"));
        let snapshot = store.query(&RequestFilter::default());

        store.add(request(2, "GET", "/"));
        store.clear();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, 1);
    }

    #[test]
    fn clear_resets_records_and_statistics() {
        let store = RequestStore::with_capacity(10);
        store.add(request(1, "GET", "/"));
        store.add(request(2, "PUT", "/x"));
        store.clear();

        assert_eq!(store.count(), 0);
        let stats = store.statistics_snapshot();
        assert_eq!(stats.total_count, 0);
        assert!(stats.count_by_method.is_empty());
        assert!(stats.top_paths.is_empty());

        // sequence keeps counting after a clear
        assert_eq!(store.add(request(3, "GET", "/")), 3);
    }

    #[test]
    fn zero_capacity_is_treated_as_one() {
        let store = RequestStore::with_capacity(0);
        store.add(request(1, "GET", "/"));
        store.add(request(2, "GET", "/"));
        assert_eq!(ids(&store), vec![2]);
    }

    #[test]
    fn subscribers_see_adds_evictions_and_clears() {
        let store = RequestStore::with_capacity(1);
        let mut rx = store.subscribe();

        store.add(request(1, "GET", "/"));
        store.add(request(2, "GET", "/"));
        store.clear();

        assert_eq!(
            rx.try_recv().unwrap(),
            StoreEvent::Added {
                id: 1,
                evicted: None,
                resident: 1
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            StoreEvent::Added {
                id: 2,
                evicted: Some(1),
                resident: 1
            }
        );
        assert_eq!(rx.try_recv().unwrap(), StoreEvent::Cleared);
    }

    #[test]
    fn add_without_subscribers_never_fails() {
        let store = RequestStore::with_capacity(4);
        drop(store.subscribe());
        store.add(request(1, "GET", "/"));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn concurrent_writers_keep_most_recent_admissions() {
        let store = Arc::new(RequestStore::with_capacity(100));

        let handles: Vec<_> = (1..=1000u64)
            .map(|id| {
                let store = store.clone();
                std::thread::spawn(move || (store.add(request(id, "POST", "/load")), id))
            })
            .collect();

        let mut admissions: Vec<(u64, u64)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        admissions.sort_unstable();

        let expected: Vec<u64> = admissions[900..].iter().map(|(_, id)| *id).collect();
        let resident = ids(&store);

        assert_eq!(store.count(), 100);
        assert_eq!(resident, expected);
        assert_eq!(store.statistics_snapshot().total_count, 100);
        assert_eq!(store.statistics_snapshot().count_by_method["POST"], 100);
    }
}
