//! Back/Forward Retention Set.
//!
//! A page navigated away from by a process swap is kept resident in its old
//! process as a suspended page, so going back can reuse it instantly.

use crate::domain::RegistrableDomain;
use crate::types::{DataStoreId, PageId, ProcessId, SuspendedPageId};
use std::collections::VecDeque;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendedPage {
    pub id: SuspendedPageId,
    pub page: PageId,
    pub process: ProcessId,
    pub domain: RegistrableDomain,
    pub data_store: DataStoreId,
    pub url: Option<Url>,
}

#[derive(Debug)]
pub struct BackForwardCache {
    capacity: usize,
    /// Oldest first.
    entries: VecDeque<SuspendedPage>,
}

impl BackForwardCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
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

    pub fn get(&self, id: SuspendedPageId) -> Option<&SuspendedPage> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: SuspendedPageId) -> bool {
        self.get(id).is_some()
    }

    pub fn holds_process(&self, process: ProcessId) -> bool {
        self.entries.iter().any(|e| e.process == process)
    }

    /// Retain a suspended page. Returns whatever fell out (possibly `page`
    /// itself when the capacity is zero).
    pub fn add(&mut self, page: SuspendedPage) -> Vec<SuspendedPage> {
        if self.capacity == 0 {
            return vec![page];
        }
        self.entries.push_back(page);
        self.trim()
    }

    pub fn take(&mut self, id: SuspendedPageId) -> Option<SuspendedPage> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(pos)
    }

    /// Take the most recent suspended page whose process can serve
    /// (domain, data store). Pages hosted by `exclude` are left in place.
    pub fn take_for_domain(
        &mut self,
        domain: &RegistrableDomain,
        data_store: DataStoreId,
        exclude: Option<ProcessId>,
    ) -> Option<SuspendedPage> {
        if domain.is_empty() {
            return None;
        }
        let pos = self.entries.iter().rposition(|e| {
            e.domain == *domain && e.data_store == data_store && Some(e.process) != exclude
        })?;
        self.entries.remove(pos)
    }

    pub fn remove_for_process(&mut self, process: ProcessId) -> Vec<SuspendedPage> {
        self.remove_where(|e| e.process == process)
    }

    pub fn remove_for_page(&mut self, page: PageId) -> Vec<SuspendedPage> {
        self.remove_where(|e| e.page == page)
    }

    pub fn set_capacity(&mut self, capacity: usize) -> Vec<SuspendedPage> {
        self.capacity = capacity;
        self.trim()
    }

    pub fn clear(&mut self) -> Vec<SuspendedPage> {
        self.entries.drain(..).collect()
    }

    fn trim(&mut self) -> Vec<SuspendedPage> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.entries.pop_front() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    fn remove_where(&mut self, pred: impl Fn(&SuspendedPage) -> bool) -> Vec<SuspendedPage> {
        let (gone, kept): (Vec<_>, Vec<_>) = self.entries.drain(..).partition(|e| pred(e));
        self.entries = kept.into();
        gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suspended(id: u64, process: u64, host: &str) -> SuspendedPage {
        SuspendedPage {
            id: SuspendedPageId(id),
            page: PageId(id),
            process: ProcessId(process),
            domain: RegistrableDomain::from_host(host),
            data_store: DataStoreId(1),
            url: None,
        }
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut bf = BackForwardCache::new(2);
        assert!(bf.add(suspended(1, 1, "a.example")).is_empty());
        assert!(bf.add(suspended(2, 2, "b.example")).is_empty());
        let evicted = bf.add(suspended(3, 3, "c.example"));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, SuspendedPageId(1));
        assert_eq!(bf.len(), 2);
    }

    #[test]
    fn test_zero_capacity_returns_page() {
        let mut bf = BackForwardCache::new(0);
        let evicted = bf.add(suspended(1, 1, "a.example"));
        assert_eq!(evicted[0].id, SuspendedPageId(1));
        assert!(bf.is_empty());
    }

    #[test]
    fn test_take_for_domain() {
        let mut bf = BackForwardCache::new(4);
        bf.add(suspended(1, 1, "a.example"));
        bf.add(suspended(2, 2, "www.a.example"));
        let taken =
            bf.take_for_domain(&RegistrableDomain::from_host("a.example"), DataStoreId(1), None);
        assert_eq!(taken.map(|s| s.id), Some(SuspendedPageId(2)));
        assert!(bf
            .take_for_domain(&RegistrableDomain::from_host("a.example"), DataStoreId(9), None)
            .is_none());
        assert!(bf
            .take_for_domain(&RegistrableDomain::default(), DataStoreId(1), None)
            .is_none());
    }

    #[test]
    fn test_take_for_domain_skips_excluded_process() {
        let mut bf = BackForwardCache::new(4);
        bf.add(suspended(1, 1, "a.example"));
        bf.add(suspended(2, 7, "a.example"));
        let domain = RegistrableDomain::from_host("a.example");

        let taken = bf.take_for_domain(&domain, DataStoreId(1), Some(ProcessId(7)));
        assert_eq!(taken.map(|s| s.id), Some(SuspendedPageId(1)));
        assert!(bf.take_for_domain(&domain, DataStoreId(1), Some(ProcessId(7))).is_none());
        assert!(bf.contains(SuspendedPageId(2)));
    }

    #[test]
    fn test_remove_for_process_and_clear() {
        let mut bf = BackForwardCache::new(4);
        bf.add(suspended(1, 7, "a.example"));
        bf.add(suspended(2, 7, "b.example"));
        bf.add(suspended(3, 8, "c.example"));
        assert!(bf.holds_process(ProcessId(7)));
        assert_eq!(bf.remove_for_process(ProcessId(7)).len(), 2);
        assert!(!bf.holds_process(ProcessId(7)));
        assert_eq!(bf.clear().len(), 1);
        assert!(bf.is_empty());
    }
}
