//! Prewarm hints gathered per registrable domain.

use crate::domain::RegistrableDomain;
use crate::ipc::protocol::PrewarmInformation;
use std::collections::HashMap;

/// At most this many domains keep prewarm hints.
pub const MAXIMUM_PREWARM_DOMAINS: usize = 100;

#[derive(Debug, Default)]
pub struct PrewarmInformationStore {
    entries: HashMap<RegistrableDomain, PrewarmInformation>,
}

impl PrewarmInformationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record hints for `domain`. When full, an arbitrary other domain is
    /// dropped to make room.
    pub fn record(&mut self, domain: RegistrableDomain, information: PrewarmInformation) {
        if domain.is_empty() {
            return;
        }
        if !self.entries.contains_key(&domain)
            && self.entries.len() >= MAXIMUM_PREWARM_DOMAINS
            && let Some(victim) = self.entries.keys().next().cloned()
        {
            self.entries.remove(&victim);
        }
        self.entries.insert(domain, information);
    }

    pub fn get(&self, domain: &RegistrableDomain) -> Option<&PrewarmInformation> {
        self.entries.get(domain)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(resource: &str) -> PrewarmInformation {
        PrewarmInformation {
            resources: vec![resource.to_string()],
        }
    }

    #[test]
    fn test_record_and_replace() {
        let mut store = PrewarmInformationStore::new();
        let domain = RegistrableDomain::from_host("a.example");
        store.record(domain.clone(), info("one"));
        store.record(domain.clone(), info("two"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&domain), Some(&info("two")));
    }

    #[test]
    fn test_bounded() {
        let mut store = PrewarmInformationStore::new();
        for i in 0..(MAXIMUM_PREWARM_DOMAINS + 10) {
            store.record(
                RegistrableDomain::from_host(&format!("site{}.example", i)),
                info("x"),
            );
        }
        assert_eq!(store.len(), MAXIMUM_PREWARM_DOMAINS);
        let last = RegistrableDomain::from_host(&format!("site{}.example", MAXIMUM_PREWARM_DOMAINS + 9));
        assert!(store.get(&last).is_some());
    }

    #[test]
    fn test_empty_domain_ignored() {
        let mut store = PrewarmInformationStore::new();
        store.record(RegistrableDomain::default(), info("x"));
        assert!(store.is_empty());
    }
}
