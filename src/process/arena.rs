//! Reference-counted storage for worker records.
//!
//! Containers (live list, Process Cache, back/forward set, pages) hold
//! [`ProcessId`]s and account for them with [`ProcessArena::retain`] and
//! [`ProcessArena::release`]. A record is reclaimed only once nothing
//! references it and its OS process has exited.

use super::worker::{ProcessState, WorkerProcess};
use crate::types::ProcessId;
use std::collections::BTreeMap;

struct Slot {
    process: WorkerProcess,
    refs: usize,
}

#[derive(Default)]
pub struct ProcessArena {
    slots: BTreeMap<ProcessId, Slot>,
}

impl ProcessArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new record holding one reference (the pool's own).
    pub fn insert(&mut self, process: WorkerProcess) -> ProcessId {
        let id = process.id();
        self.slots.insert(id, Slot { process, refs: 1 });
        id
    }

    pub fn retain(&mut self, id: ProcessId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.refs += 1;
        }
    }

    /// Drop one reference. Returns the remaining count.
    pub fn release(&mut self, id: ProcessId) -> usize {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                debug_assert!(slot.refs > 0, "release without retain for {}", id);
                slot.refs = slot.refs.saturating_sub(1);
                slot.refs
            }
            None => 0,
        }
    }

    pub fn ref_count(&self, id: ProcessId) -> usize {
        self.slots.get(&id).map(|s| s.refs).unwrap_or(0)
    }

    pub fn get(&self, id: ProcessId) -> Option<&WorkerProcess> {
        self.slots.get(&id).map(|s| &s.process)
    }

    pub fn get_mut(&mut self, id: ProcessId) -> Option<&mut WorkerProcess> {
        self.slots.get_mut(&id).map(|s| &mut s.process)
    }

    pub fn contains(&self, id: ProcessId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ProcessId> {
        self.slots.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerProcess> {
        self.slots.values().map(|s| &s.process)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reclaim unreferenced, terminated records whose OS process has exited.
    pub fn collect(&mut self) -> Vec<ProcessId> {
        let reclaimable: Vec<ProcessId> = self
            .slots
            .iter_mut()
            .filter(|(_, slot)| slot.refs == 0 && slot.process.state() == ProcessState::Terminated)
            .filter_map(|(id, slot)| slot.process.reap().map(|_| *id))
            .collect();
        for id in &reclaimable {
            self.slots.remove(id);
            tracing::trace!(process_id = %id, "Reclaimed worker record");
        }
        reclaimable
    }

    /// Remove every record regardless of references.
    pub fn drain(&mut self) -> Vec<WorkerProcess> {
        std::mem::take(&mut self.slots)
            .into_values()
            .map(|s| s.process)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::launcher::{InProcessLauncher, LaunchParameters, WorkerLauncher};
    use crate::types::ProcessRole;
    use std::time::Instant;

    fn worker(launcher: &InProcessLauncher, id: u64) -> WorkerProcess {
        let launched = launcher
            .launch(&LaunchParameters {
                process_id: ProcessId(id),
                role: ProcessRole::Content,
                sandbox_profile: None,
                additional_read_access_paths: Vec::new(),
                additional_read_write_paths: Vec::new(),
            })
            .unwrap();
        WorkerProcess::new(
            ProcessId(id),
            ProcessRole::Content,
            launched,
            None,
            false,
            Instant::now(),
        )
    }

    #[test]
    fn test_release_from_one_container_keeps_record() {
        let launcher = InProcessLauncher::new();
        let mut arena = ProcessArena::new();
        let id = arena.insert(worker(&launcher, 1));
        arena.retain(id); // e.g. the Process Cache

        assert_eq!(arena.release(id), 1);
        arena.get_mut(id).unwrap().shut_down();
        assert!(arena.collect().is_empty());
        assert!(arena.contains(id));

        assert_eq!(arena.release(id), 0);
        assert_eq!(arena.collect(), vec![id]);
        assert!(!arena.contains(id));
    }

    #[test]
    fn test_unreferenced_running_record_is_kept() {
        let launcher = InProcessLauncher::new();
        let mut arena = ProcessArena::new();
        let id = arena.insert(worker(&launcher, 2));
        arena.release(id);
        assert!(arena.collect().is_empty());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut arena = ProcessArena::new();
        assert_eq!(arena.release(ProcessId(99)), 0);
        assert_eq!(arena.ref_count(ProcessId(99)), 0);
        assert!(arena.is_empty());
    }
}
