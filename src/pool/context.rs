//! Process-wide state shared by every pool.
//!
//! A [`PoolContext`] owns what would otherwise be globals: the registry of
//! live pools, pool-creation listeners, the run-once initialization latch,
//! id counters and the set of processes hosting service workers. Tests build
//! one context per test, so pools in different tests never see each other.

use super::{PoolHandle, ProcessPool};
use crate::clock::{Clock, SystemClock};
use crate::memory_pressure::{self, MemoryPressure};
use crate::process::launcher::{ProcessLauncher, WorkerLauncher};
use crate::types::{DownloadId, PageId, PoolId, ProcessId, SuspendedPageId};
use std::cell::{Cell, OnceCell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

type CreationListener = Box<dyn FnMut(&mut ProcessPool)>;
pub(crate) type MemorySampler = Rc<dyn Fn() -> MemoryPressure>;

#[derive(Default)]
struct Counters {
    process: Cell<u64>,
    page: Cell<u64>,
    suspended_page: Cell<u64>,
    pool: Cell<u64>,
    download: Cell<u64>,
}

fn bump(counter: &Cell<u64>) -> u64 {
    let next = counter.get() + 1;
    counter.set(next);
    next
}

struct ContextInner {
    launcher: Rc<dyn WorkerLauncher>,
    clock: Rc<dyn Clock>,
    memory_sampler: RefCell<MemorySampler>,
    system_memory_mib: Cell<u64>,
    pools: RefCell<Vec<(PoolId, Weak<RefCell<ProcessPool>>)>>,
    listeners: RefCell<BTreeMap<u64, CreationListener>>,
    next_listener_id: Cell<u64>,
    dispatching_listeners: Cell<bool>,
    /// Listeners unregistered while the listener map was checked out.
    unregistered_while_dispatching: RefCell<BTreeSet<u64>>,
    global_init: OnceCell<()>,
    global_init_runs: Cell<usize>,
    service_worker_processes: RefCell<BTreeSet<(PoolId, ProcessId)>>,
    counters: Counters,
}

/// Cheap-to-clone handle to the process-wide context.
#[derive(Clone)]
pub struct PoolContext {
    inner: Rc<ContextInner>,
}

impl PoolContext {
    pub fn new(launcher: impl WorkerLauncher + 'static, clock: impl Clock + 'static) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                launcher: Rc::new(launcher),
                clock: Rc::new(clock),
                memory_sampler: RefCell::new(Rc::new(memory_pressure::current_memory_pressure)),
                system_memory_mib: Cell::new(memory_pressure::system_memory_mib()),
                pools: RefCell::new(Vec::new()),
                listeners: RefCell::new(BTreeMap::new()),
                next_listener_id: Cell::new(0),
                dispatching_listeners: Cell::new(false),
                unregistered_while_dispatching: RefCell::new(BTreeSet::new()),
                global_init: OnceCell::new(),
                global_init_runs: Cell::new(0),
                service_worker_processes: RefCell::new(BTreeSet::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Context that spawns real worker processes from the current executable.
    pub fn system() -> Self {
        Self::new(ProcessLauncher::new(), SystemClock)
    }

    /// Replace the memory sampler used by pools created afterwards.
    pub fn set_memory_sampler(&self, sampler: impl Fn() -> MemoryPressure + 'static) {
        *self.inner.memory_sampler.borrow_mut() = Rc::new(sampler);
    }

    /// Override the detected system memory (drives derived cache capacities).
    pub fn set_system_memory_mib(&self, mib: u64) {
        self.inner.system_memory_mib.set(mib);
    }

    pub fn system_memory_mib(&self) -> u64 {
        self.inner.system_memory_mib.get()
    }

    pub(crate) fn memory_sampler(&self) -> MemorySampler {
        self.inner.memory_sampler.borrow().clone()
    }

    pub fn launcher(&self) -> Rc<dyn WorkerLauncher> {
        self.inner.launcher.clone()
    }

    pub fn clock(&self) -> Rc<dyn Clock> {
        self.inner.clock.clone()
    }

    /// One-time setup shared by all pools. Runs on the first pool creation.
    pub(crate) fn ensure_global_initialization(&self) {
        self.inner.global_init.get_or_init(|| {
            // Writes to a dead worker must fail with EPIPE, not kill us.
            unsafe {
                nix::sys::signal::signal(
                    nix::sys::signal::Signal::SIGPIPE,
                    nix::sys::signal::SigHandler::SigIgn,
                )
                .ok();
            }
            self.inner
                .global_init_runs
                .set(self.inner.global_init_runs.get() + 1);
            tracing::debug!("Global pool initialization done");
        });
    }

    pub fn global_initialization_runs(&self) -> usize {
        self.inner.global_init_runs.get()
    }

    pub(crate) fn next_process_id(&self) -> ProcessId {
        ProcessId(bump(&self.inner.counters.process))
    }

    pub(crate) fn next_page_id(&self) -> PageId {
        PageId(bump(&self.inner.counters.page))
    }

    pub(crate) fn next_suspended_page_id(&self) -> SuspendedPageId {
        SuspendedPageId(bump(&self.inner.counters.suspended_page))
    }

    pub(crate) fn next_pool_id(&self) -> PoolId {
        PoolId(bump(&self.inner.counters.pool))
    }

    pub(crate) fn next_download_id(&self) -> DownloadId {
        DownloadId(bump(&self.inner.counters.download))
    }

    pub(crate) fn register_pool(&self, id: PoolId, pool: &PoolHandle) {
        let mut pools = self.inner.pools.borrow_mut();
        pools.retain(|(_, weak)| weak.strong_count() > 0);
        pools.push((id, Rc::downgrade(pool)));
    }

    pub(crate) fn unregister_pool(&self, id: PoolId) {
        // May run from a pool's Drop while the registry is being walked.
        if let Ok(mut pools) = self.inner.pools.try_borrow_mut() {
            pools.retain(|(pool, weak)| *pool != id && weak.strong_count() > 0);
        }
        self.inner
            .service_worker_processes
            .borrow_mut()
            .retain(|(pool, _)| *pool != id);
    }

    /// Every pool still alive.
    pub fn all_pools(&self) -> Vec<PoolHandle> {
        self.inner
            .pools
            .borrow()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    pub fn register_creation_listener(
        &self,
        listener: impl FnMut(&mut ProcessPool) + 'static,
    ) -> u64 {
        let id = bump(&self.inner.next_listener_id);
        self.inner
            .listeners
            .borrow_mut()
            .insert(id, Box::new(listener));
        id
    }

    /// Remove a listener. Safe to call from inside the listener itself.
    pub fn unregister_creation_listener(&self, id: u64) -> bool {
        if self.inner.listeners.borrow_mut().remove(&id).is_some() {
            return true;
        }
        if self.inner.dispatching_listeners.get() {
            return self
                .inner
                .unregistered_while_dispatching
                .borrow_mut()
                .insert(id);
        }
        false
    }

    pub fn creation_listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    pub(crate) fn notify_pool_created(&self, pool: &mut ProcessPool) {
        let mut listeners = std::mem::take(&mut *self.inner.listeners.borrow_mut());
        self.inner.dispatching_listeners.set(true);
        for (id, listener) in listeners.iter_mut() {
            if self
                .inner
                .unregistered_while_dispatching
                .borrow()
                .contains(id)
            {
                continue;
            }
            listener(pool);
        }
        self.inner.dispatching_listeners.set(false);

        let removed = std::mem::take(&mut *self.inner.unregistered_while_dispatching.borrow_mut());
        listeners.retain(|id, _| !removed.contains(id));
        // Keep listeners registered during dispatch as well.
        self.inner.listeners.borrow_mut().append(&mut listeners);
    }

    pub(crate) fn add_service_worker_process(&self, pool: PoolId, process: ProcessId) {
        self.inner
            .service_worker_processes
            .borrow_mut()
            .insert((pool, process));
    }

    pub(crate) fn remove_service_worker_process(&self, pool: PoolId, process: ProcessId) {
        self.inner
            .service_worker_processes
            .borrow_mut()
            .remove(&(pool, process));
    }

    /// Processes hosting service workers, across all pools.
    pub fn service_worker_processes(&self) -> Vec<(PoolId, ProcessId)> {
        self.inner
            .service_worker_processes
            .borrow()
            .iter()
            .copied()
            .collect()
    }

    /// Forward a memory-pressure warning to every pool.
    ///
    /// A pool that is currently borrowed (the caller is inside one of its
    /// operations) is skipped.
    pub fn broadcast_memory_pressure(&self, critical: bool) -> usize {
        let mut notified = 0;
        for pool in self.all_pools() {
            match pool.try_borrow_mut() {
                Ok(mut pool) => {
                    pool.handle_memory_pressure(critical);
                    notified += 1;
                }
                Err(_) => tracing::warn!("Skipping busy pool during memory pressure broadcast"),
            }
        }
        notified
    }
}

impl std::fmt::Debug for PoolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolContext")
            .field("pools", &self.inner.pools.borrow().len())
            .field("listeners", &self.inner.listeners.borrow().len())
            .finish()
    }
}
