//! Process Cache: idle, warm content processes keyed by site and data store.
//!
//! Entries are ordered by insertion; the oldest entry is evicted when the
//! cache is full. The cache holds ids only. The caller owns reference
//! counting and shuts down whatever is evicted.

use crate::domain::RegistrableDomain;
use crate::types::{DataStoreId, ProcessId};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub domain: RegistrableDomain,
    pub data_store: DataStoreId,
    pub process: ProcessId,
    pub expires_at: Instant,
}

/// Outcome of [`ProcessCache::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheInsert {
    /// Cached; `evicted` must be shut down by the caller.
    Inserted { evicted: Vec<ProcessId> },
    /// Not cacheable (no capacity or no registrable domain).
    Rejected,
}

#[derive(Debug)]
pub struct ProcessCache {
    capacity: usize,
    lifetime: Duration,
    /// Oldest first.
    entries: VecDeque<CacheEntry>,
}

impl ProcessCache {
    pub fn new(capacity: usize, lifetime: Duration) -> Self {
        Self {
            capacity,
            lifetime,
            entries: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, process: ProcessId) -> bool {
        self.entries.iter().any(|e| e.process == process)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }

    /// Cache `process` under (domain, data store).
    ///
    /// An entry already stored under the same key is evicted; if the cache is
    /// full the oldest entry is evicted.
    pub fn insert(
        &mut self,
        domain: RegistrableDomain,
        data_store: DataStoreId,
        process: ProcessId,
        now: Instant,
    ) -> CacheInsert {
        if self.capacity == 0 || domain.is_empty() {
            return CacheInsert::Rejected;
        }

        // Re-inserting the same process refreshes its key and recency.
        self.entries.retain(|e| e.process != process);

        let mut evicted = Vec::new();
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.domain == domain && e.data_store == data_store)
            && let Some(old) = self.entries.remove(pos)
        {
            evicted.push(old.process);
        }
        while self.entries.len() >= self.capacity {
            match self.entries.pop_front() {
                Some(oldest) => evicted.push(oldest.process),
                None => break,
            }
        }

        self.entries.push_back(CacheEntry {
            domain,
            data_store,
            process,
            expires_at: now + self.lifetime,
        });
        CacheInsert::Inserted { evicted }
    }

    /// Remove and return the entry for (domain, data store).
    pub fn take(&mut self, domain: &RegistrableDomain, data_store: DataStoreId) -> Option<ProcessId> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.domain == *domain && e.data_store == data_store)?;
        self.entries.remove(pos).map(|e| e.process)
    }

    /// Remove `process` if cached.
    pub fn remove(&mut self, process: ProcessId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.process != process);
        self.entries.len() != before
    }

    /// Change capacity, evicting the oldest entries that no longer fit.
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<ProcessId> {
        self.capacity = capacity;
        let mut evicted = Vec::new();
        while self.entries.len() > capacity {
            if let Some(oldest) = self.entries.pop_front() {
                evicted.push(oldest.process);
            }
        }
        evicted
    }

    pub fn clear(&mut self) -> Vec<ProcessId> {
        self.entries.drain(..).map(|e| e.process).collect()
    }

    /// Evict every entry belonging to `data_store`.
    pub fn remove_for_data_store(&mut self, data_store: DataStoreId) -> Vec<ProcessId> {
        let (gone, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.data_store == data_store);
        self.entries = kept.into();
        gone.into_iter().map(|e| e.process).collect()
    }

    /// Evict entries whose lifetime has run out.
    pub fn take_expired(&mut self, now: Instant) -> Vec<ProcessId> {
        let (gone, kept): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|e| e.expires_at <= now);
        self.entries = kept.into();
        gone.into_iter().map(|e| e.process).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const STORE: DataStoreId = DataStoreId(1);

    fn domain(s: &str) -> RegistrableDomain {
        RegistrableDomain::from_host(s)
    }

    fn cache(capacity: usize) -> ProcessCache {
        ProcessCache::new(capacity, Duration::from_secs(60))
    }

    #[test]
    fn test_third_insert_evicts_first() {
        let now = Instant::now();
        let mut cache = cache(2);
        assert_eq!(
            cache.insert(domain("a.example"), STORE, ProcessId(1), now),
            CacheInsert::Inserted { evicted: vec![] }
        );
        cache.insert(domain("b.example"), STORE, ProcessId(2), now);
        assert_eq!(
            cache.insert(domain("c.example"), STORE, ProcessId(3), now),
            CacheInsert::Inserted {
                evicted: vec![ProcessId(1)]
            }
        );
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(ProcessId(1)));
    }

    #[test]
    fn test_take_twice() {
        let mut cache = cache(2);
        cache.insert(domain("a.example"), STORE, ProcessId(1), Instant::now());
        assert_eq!(cache.take(&domain("a.example"), STORE), Some(ProcessId(1)));
        assert_eq!(cache.take(&domain("a.example"), STORE), None);
    }

    #[test]
    fn test_key_includes_data_store() {
        let mut cache = cache(4);
        cache.insert(domain("a.example"), STORE, ProcessId(1), Instant::now());
        assert_eq!(cache.take(&domain("a.example"), DataStoreId(2)), None);
        assert_eq!(cache.take(&domain("a.example"), STORE), Some(ProcessId(1)));
    }

    #[test]
    fn test_same_key_replaces() {
        let now = Instant::now();
        let mut cache = cache(4);
        cache.insert(domain("a.example"), STORE, ProcessId(1), now);
        assert_eq!(
            cache.insert(domain("a.example"), STORE, ProcessId(2), now),
            CacheInsert::Inserted {
                evicted: vec![ProcessId(1)]
            }
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_rejects_without_capacity_or_domain() {
        let now = Instant::now();
        assert_eq!(
            cache(0).insert(domain("a.example"), STORE, ProcessId(1), now),
            CacheInsert::Rejected
        );
        assert_eq!(
            cache(2).insert(RegistrableDomain::default(), STORE, ProcessId(1), now),
            CacheInsert::Rejected
        );
    }

    #[test]
    fn test_shrink_capacity() {
        let now = Instant::now();
        let mut cache = cache(3);
        for (i, host) in ["a.example", "b.example", "c.example"].iter().enumerate() {
            cache.insert(domain(host), STORE, ProcessId(i as u64), now);
        }
        assert_eq!(cache.set_capacity(1), vec![ProcessId(0), ProcessId(1)]);
        assert_eq!(cache.clear(), vec![ProcessId(2)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expiry_and_store_eviction() {
        let now = Instant::now();
        let mut cache = ProcessCache::new(4, Duration::from_secs(10));
        cache.insert(domain("a.example"), STORE, ProcessId(1), now);
        cache.insert(domain("b.example"), DataStoreId(2), ProcessId(2), now + Duration::from_secs(5));

        assert_eq!(cache.take_expired(now + Duration::from_secs(10)), vec![ProcessId(1)]);
        assert_eq!(cache.remove_for_data_store(DataStoreId(2)), vec![ProcessId(2)]);
        assert!(cache.is_empty());
    }

    proptest! {
        /// Size never exceeds capacity and every process is cached at most once.
        #[test]
        fn size_bounded_by_capacity(
            capacity in 0usize..5,
            inserts in prop::collection::vec((0u8..6, 0u64..3, 0u64..8), 0..40),
        ) {
            let now = Instant::now();
            let mut cache = ProcessCache::new(capacity, Duration::from_secs(60));
            for (site, store, process) in inserts {
                let domain = RegistrableDomain::from_host(&format!("site{}.example", site));
                cache.insert(domain, DataStoreId(store), ProcessId(process), now);
                prop_assert!(cache.len() <= capacity);
                let mut ids: Vec<_> = cache.entries().map(|e| e.process).collect();
                ids.sort();
                ids.dedup();
                prop_assert_eq!(ids.len(), cache.len());
            }
        }
    }
}
