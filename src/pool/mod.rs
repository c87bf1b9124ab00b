//! The process pool orchestrator.
//!
//! A [`ProcessPool`] owns every worker it launched and decides which one
//! serves each page. All state lives on the coordinating thread; workers are
//! reached only through their [`Connection`](crate::ipc::Connection)s.
//! [`ProcessPool::process_events`] drains inbound messages, handles worker
//! exits and fires timers, and must be called regularly by the embedder.
//!
//! Callbacks the pool invokes (reply handlers, external message receivers,
//! [`PoolClient`] and [`PoolSupplement`] methods) run while the pool is
//! mutably borrowed and must not call back into it.

pub mod back_forward;
pub mod cache;
pub mod context;
pub mod crash;
pub mod navigation;
pub mod prewarm;
pub mod selector;


pub use back_forward::{BackForwardCache, SuspendedPage};
pub use cache::{CacheEntry, CacheInsert, ProcessCache};
pub use context::PoolContext;
pub use crash::{CrashVerdict, CrashWindow};
pub use navigation::{
    BackForwardItem, NavigationRequest, NavigationResult, ProcessSource, SelectionReason,
};
pub use prewarm::PrewarmInformationStore;

use crate::clock::{Clock, Timer};
use crate::config::{CacheModel, PoolConfiguration, UrlSchemeKind, UrlSchemeRegistration};
use crate::domain::RegistrableDomain;
use crate::error::{PoolError, Result};
use crate::ipc::connection::ReplyHandler;
use crate::ipc::dispatch::{MessageReceiverMap, SharedReceiver};
use crate::ipc::protocol::{
    AutomationSessionProxy, ClosePage, DidCommitLoad, DomainPrewarmInformation, Download, Envelope,
    InitializationParameters, LoadUrl, MemoryPressureEvent, SetCacheModel, names, receivers,
};
use crate::memory_pressure::MemoryPressureMonitor;
use crate::process::arena::ProcessArena;
use crate::process::launcher::{LaunchParameters, WorkerLauncher};
use crate::process::signals::{TerminationReason, WorkerFailure};
use crate::process::worker::{ProcessState, WorkerProcess};
use crate::types::{
    AutomationSessionId, DataStore, DataStoreId, DownloadId, PageId, PoolId, ProcessId, ProcessRole,
    SuspendedPageId,
};
use selector::{Decision, SelectionInputs};
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use url::Url;

/// Shared handle to a pool.
pub type PoolHandle = Rc<RefCell<ProcessPool>>;

/// Events the pool reports to its embedder. Every method has a no-op default.
pub trait PoolClient {
    fn content_process_crashed(&mut self, _process: ProcessId, _reason: TerminationReason) {}
    fn gpu_process_crashed(&mut self, _reason: TerminationReason) {}
    fn network_process_crashed(&mut self, _reason: TerminationReason) {}
    fn service_worker_process_crashed(&mut self, _process: ProcessId, _reason: TerminationReason) {}
    fn plugin_process_crashed(&mut self, _process: ProcessId, _reason: TerminationReason) {}
    fn started_using_gamepads(&mut self) {}
    fn stopped_using_gamepads(&mut self) {}
    fn automation_session_terminated(&mut self, _session: AutomationSessionId) {}
    /// A process gained its first page (`foreground`) or went idle.
    fn process_priority_changed(&mut self, _process: ProcessId, _foreground: bool) {}
}

/// Subsystems that need to hear about worker exits.
pub trait PoolSupplement {
    fn network_process_did_crash(&mut self) {}
    fn process_did_close(&mut self, _process: ProcessId, _role: ProcessRole) {}
}

/// Whether removing a process from the cache should also stop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    Shutdown,
    KeepAlive,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    pub processes_launched: usize,
    pub launch_failures: usize,
    pub crashes: usize,
    pub gpu_crash_window_trips: usize,
    pub unroutable_messages: usize,
    pub malformed_messages: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub navigations: usize,
    pub process_swaps: usize,
    pub live_processes: usize,
    pub cached_processes: usize,
    pub suspended_pages: usize,
    pub pages: usize,
}

#[derive(Debug, Clone)]
struct Page {
    id: PageId,
    process: ProcessId,
    data_store: DataStore,
    url: Option<Url>,
    committed: bool,
    opened_by_script_with_opener: bool,
    has_opened_windows: bool,
}

#[derive(Clone)]
enum Route {
    Pool,
    Page(PageId),
    External(SharedReceiver),
}

struct DataStorePages {
    store: DataStore,
    pages: BTreeSet<PageId>,
}

pub struct ProcessPool {
    id: PoolId,
    context: PoolContext,
    launcher: Rc<dyn WorkerLauncher>,
    clock: Rc<dyn Clock>,
    config: PoolConfiguration,
    client: Option<Box<dyn PoolClient>>,
    supplements: Vec<Box<dyn PoolSupplement>>,
    routes: MessageReceiverMap<Route>,

    arena: ProcessArena,
    /// Web content processes (content and service-worker hosts).
    live: Vec<ProcessId>,
    network: Option<ProcessId>,
    gpu: Option<ProcessId>,
    plugins: BTreeMap<PathBuf, ProcessId>,

    prewarmed: Option<ProcessId>,
    prewarm_timer: Timer,
    prewarm_info: PrewarmInformationStore,
    client_would_benefit_from_prewarming: bool,

    cache: ProcessCache,
    back_forward: BackForwardCache,
    /// Debug retention of swapped-out processes. Not counted in any capacity
    /// and holds no reference; entries are validated on lookup.
    retained_swapped: HashMap<RegistrableDomain, ProcessId>,
    crash_window: CrashWindow,

    pages: BTreeMap<PageId, Page>,
    data_store_pages: HashMap<DataStoreId, DataStorePages>,
    gamepad_processes: BTreeSet<ProcessId>,
    automation_session: Option<AutomationSessionId>,

    termination_enabled: bool,
    system_memory_mib: u64,
    memory_monitor: MemoryPressureMonitor,
    stats: PoolStatistics,
    is_shut_down: bool,
}

impl ProcessPool {
    /// Build a pool, register it with `context` and run creation listeners.
    pub fn create(context: &PoolContext, config: PoolConfiguration) -> Result<PoolHandle> {
        config.validate()?;
        context.ensure_global_initialization();

        let pool = Rc::new(RefCell::new(Self::new(context.clone(), config)));
        let id = pool.borrow().id;
        context.register_pool(id, &pool);
        context.notify_pool_created(&mut pool.borrow_mut());

        tracing::info!(pool = %id, "Process pool created");
        Ok(pool)
    }

    fn new(context: PoolContext, config: PoolConfiguration) -> Self {
        let system_memory_mib = context.system_memory_mib();
        let sampler = context.memory_sampler();
        let mut routes = MessageReceiverMap::new();
        routes.add_receiver(receivers::WORKER_PROCESS, Route::Pool);

        Self {
            id: context.next_pool_id(),
            launcher: context.launcher(),
            clock: context.clock(),
            client: None,
            supplements: Vec::new(),
            routes,
            arena: ProcessArena::new(),
            live: Vec::new(),
            network: None,
            gpu: None,
            plugins: BTreeMap::new(),
            prewarmed: None,
            prewarm_timer: Timer::new(),
            prewarm_info: PrewarmInformationStore::new(),
            client_would_benefit_from_prewarming: false,
            cache: ProcessCache::new(
                config.process_cache_capacity(system_memory_mib),
                config.cached_process_lifetime,
            ),
            back_forward: BackForwardCache::new(config.back_forward_capacity(system_memory_mib)),
            retained_swapped: HashMap::new(),
            crash_window: CrashWindow::new(),
            pages: BTreeMap::new(),
            data_store_pages: HashMap::new(),
            gamepad_processes: BTreeSet::new(),
            automation_session: None,
            termination_enabled: !config.process_termination_grace,
            system_memory_mib,
            memory_monitor: MemoryPressureMonitor::with_sampler(
                config.memory_pressure_debounce,
                move || sampler(),
            ),
            stats: PoolStatistics::default(),
            is_shut_down: false,
            context,
            config,
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn context(&self) -> &PoolContext {
        &self.context
    }

    pub fn configuration(&self) -> &PoolConfiguration {
        &self.config
    }

    pub fn set_client(&mut self, client: Box<dyn PoolClient>) {
        self.client = Some(client);
    }

    pub fn add_supplement(&mut self, supplement: Box<dyn PoolSupplement>) {
        self.supplements.push(supplement);
    }

    pub fn process(&self, id: ProcessId) -> Option<&WorkerProcess> {
        self.arena.get(id)
    }

    /// Number of worker records still held, including terminated ones that
    /// something still references.
    pub fn process_record_count(&self) -> usize {
        self.arena.len()
    }

    pub fn live_processes(&self) -> &[ProcessId] {
        &self.live
    }

    pub fn network_process(&self) -> Option<ProcessId> {
        self.network
    }

    pub fn gpu_process(&self) -> Option<ProcessId> {
        self.gpu
    }

    pub fn prewarmed_process(&self) -> Option<ProcessId> {
        self.prewarmed
    }

    pub fn process_cache(&self) -> &ProcessCache {
        &self.cache
    }

    pub fn back_forward_cache(&self) -> &BackForwardCache {
        &self.back_forward
    }

    pub fn crash_window(&self) -> &CrashWindow {
        &self.crash_window
    }

    pub fn page_process(&self, page: PageId) -> Option<ProcessId> {
        self.pages.get(&page).map(|p| p.process)
    }

    pub fn page_url(&self, page: PageId) -> Option<&Url> {
        self.pages.get(&page).and_then(|p| p.url.as_ref())
    }

    pub fn automation_session(&self) -> Option<AutomationSessionId> {
        self.automation_session
    }

    pub fn is_process_termination_enabled(&self) -> bool {
        self.termination_enabled
    }

    fn is_usable(&self, process: ProcessId) -> bool {
        self.arena.get(process).is_some_and(|p| p.is_usable())
    }

    fn notify_client(&mut self, notify: impl FnOnce(&mut dyn PoolClient)) {
        if let Some(client) = self.client.as_deref_mut() {
            notify(client);
        }
    }

    fn send_to<T: Serialize>(&mut self, process: ProcessId, name: &str, body: &T) {
        if let Some(worker) = self.arena.get_mut(process)
            && worker.is_usable()
            && let Err(e) = worker.send(name, body)
        {
            tracing::debug!(process_id = %process, message = name, error = %e, "Send failed");
        }
    }

    /// Send to every live web content process, and optionally the network worker.
    fn broadcast<T: Serialize>(&mut self, name: &str, body: &T, include_network: bool) {
        let mut targets = self.live.clone();
        if include_network && let Some(network) = self.network {
            targets.push(network);
        }
        for process in targets {
            self.send_to(process, name, body);
        }
    }

    // ---------------------------------------------------------------------
    // Worker lifecycle
    // ---------------------------------------------------------------------

    /// Launch a worker and send it its initialization parameters.
    ///
    /// Content and service-worker hosts join the live list; network and GPU
    /// workers fill their singleton slot. A prewarmed process takes the
    /// prewarm slot and receives no work until selected.
    pub fn create_worker_process(
        &mut self,
        role: ProcessRole,
        data_store: Option<DataStore>,
        prewarmed: bool,
    ) -> Result<ProcessId> {
        if role == ProcessRole::Plugin {
            return Err(PoolError::Config(
                "plugin workers are launched through plugin_process_for".into(),
            ));
        }
        self.launch_worker(role, data_store, prewarmed, BTreeMap::new())
    }

    fn launch_worker(
        &mut self,
        role: ProcessRole,
        data_store: Option<DataStore>,
        prewarmed: bool,
        extra: BTreeMap<String, String>,
    ) -> Result<ProcessId> {
        let id = self.context.next_process_id();
        let parameters = LaunchParameters {
            process_id: id,
            role,
            sandbox_profile: self.config.sandbox_profile.clone(),
            additional_read_access_paths: self.config.additional_read_access_paths.clone(),
            additional_read_write_paths: self.config.additional_read_write_paths.clone(),
        };

        let launched = match self.launcher.launch(&parameters) {
            Ok(launched) => launched,
            Err(e) => {
                self.stats.launch_failures += 1;
                tracing::warn!(role = %role, error = %e, "Worker launch failed");
                return Err(e);
            }
        };

        let mut worker =
            WorkerProcess::new(id, role, launched, data_store, prewarmed, self.clock.now());
        worker
            .connection_mut()
            .set_ignore_timeouts(self.config.ignore_synchronous_messaging_timeouts_for_testing);

        let initialization = InitializationParameters {
            process_id: Some(id),
            role: Some(role),
            sandbox_profile: self.config.sandbox_profile.clone(),
            additional_read_access_paths: self.config.additional_read_access_paths.clone(),
            additional_read_write_paths: self.config.additional_read_write_paths.clone(),
            feature_flags: self.config.feature_flags.clone(),
            url_schemes: self.config.url_schemes.clone(),
            cache_model: self.config.cache_model,
            languages: self.config.languages.clone(),
            prewarmed,
            data_store,
            extra,
        };
        if let Err(e) = worker.send(names::INITIALIZE, &initialization) {
            self.stats.launch_failures += 1;
            tracing::warn!(role = %role, error = %e, "Worker died before initialization");
            worker.shut_down();
            return Err(e);
        }
        if role.is_web_content()
            && let Some(session) = self.automation_session
            && let Err(e) = worker.send(
                names::ENSURE_AUTOMATION_SESSION_PROXY,
                &AutomationSessionProxy { session },
            )
        {
            tracing::debug!(process_id = %id, error = %e, "Could not attach automation session");
        }

        let pid = worker.pid();
        self.arena.insert(worker);
        match role {
            ProcessRole::Content | ProcessRole::ServiceWorkerHost => self.live.push(id),
            ProcessRole::Network => self.network = Some(id),
            ProcessRole::Gpu => self.gpu = Some(id),
            ProcessRole::Plugin => {}
        }
        if prewarmed {
            self.prewarmed = Some(id);
        }
        self.stats.processes_launched += 1;

        tracing::info!(process_id = %id, pid, role = %role, prewarmed, "Launched worker");
        Ok(id)
    }

    /// Whether an idle process may be terminated right now.
    pub fn should_terminate(&self, process: ProcessId) -> bool {
        if !self.termination_enabled {
            tracing::trace!(process_id = %process, "Termination disabled");
            return false;
        }
        !self.config.always_keep_and_reuse_swapped_processes
    }

    /// End the termination grace period and sweep idle processes.
    pub fn enable_process_termination(&mut self) {
        if self.termination_enabled {
            return;
        }
        self.termination_enabled = true;
        tracing::debug!(pool = %self.id, "Process termination enabled");
        for process in self.live.clone() {
            self.maybe_shut_down(process);
        }
    }

    /// Idle policy: cache the process if possible, otherwise terminate it.
    fn maybe_shut_down(&mut self, process: ProcessId) {
        let Some(worker) = self.arena.get(process) else {
            return;
        };
        if !worker.role().is_web_content()
            || !worker.is_usable()
            || !worker.is_idle()
            || self.cache.contains(process)
        {
            return;
        }
        if worker.role() == ProcessRole::Content && self.try_add_to_cache(process) {
            return;
        }
        if self.should_terminate(process) {
            tracing::debug!(process_id = %process, "Shutting down idle process");
            self.shut_down_process(process);
        }
    }

    fn terminate_if_idle(&mut self, process: ProcessId) {
        let idle = self
            .arena
            .get(process)
            .is_some_and(|p| p.is_usable() && p.is_idle());
        if idle && self.should_terminate(process) {
            self.shut_down_process(process);
        }
    }

    fn try_add_to_cache(&mut self, process: ProcessId) -> bool {
        let Some(worker) = self.arena.get(process) else {
            return false;
        };
        let Some(store) = worker.data_store() else {
            return false;
        };
        // Nothing will come back for an ephemeral session that has ended.
        if store.ephemeral && !self.data_store_pages.contains_key(&store.id) {
            return false;
        }
        let domain = worker.registrable_domain().clone();
        let now = self.clock.now();

        match self.cache.insert(domain.clone(), store.id, process, now) {
            CacheInsert::Rejected => false,
            CacheInsert::Inserted { evicted } => {
                self.arena.retain(process);
                tracing::debug!(process_id = %process, domain = %domain, "Added process to cache");
                self.notify_client(|c| c.process_priority_changed(process, false));
                for old in evicted {
                    tracing::debug!(process_id = %old, "Evicted process from cache");
                    self.arena.release(old);
                    self.terminate_if_idle(old);
                }
                true
            }
        }
    }

    /// Remove `process` from the Process Cache. Returns whether it was cached.
    pub fn remove_cached_process(&mut self, process: ProcessId, policy: ShutdownPolicy) -> bool {
        if !self.cache.remove(process) {
            return false;
        }
        self.arena.release(process);
        if policy == ShutdownPolicy::Shutdown {
            self.terminate_if_idle(process);
        }
        true
    }

    /// Ask a worker to exit and drop it from every container.
    pub fn shut_down_process(&mut self, process: ProcessId) {
        let Some(worker) = self.arena.get_mut(process) else {
            return;
        };
        if worker.state() != ProcessState::Terminated {
            tracing::info!(process_id = %process, role = %worker.role(), "Shutting down worker");
            worker.shut_down();
        }
        self.remove_from_containers(process);
    }

    fn remove_from_containers(&mut self, process: ProcessId) {
        if let Some(pos) = self.live.iter().position(|p| *p == process) {
            self.live.remove(pos);
            self.arena.release(process);
        }
        if self.network == Some(process) {
            self.network = None;
            self.arena.release(process);
        }
        if self.gpu == Some(process) {
            self.gpu = None;
            self.arena.release(process);
        }
        let plugin = self
            .plugins
            .iter()
            .find(|(_, p)| **p == process)
            .map(|(path, _)| path.clone());
        if let Some(path) = plugin {
            self.plugins.remove(&path);
            self.arena.release(process);
        }
        if self.cache.remove(process) {
            self.arena.release(process);
        }
        for suspended in self.back_forward.remove_for_process(process) {
            self.discard_suspended_page(suspended, false);
        }
        if self.prewarmed == Some(process) {
            self.prewarmed = None;
        }
        self.retained_swapped.retain(|_, p| *p != process);
        if self.gamepad_processes.remove(&process) && self.gamepad_processes.is_empty() {
            self.notify_client(|c| c.stopped_using_gamepads());
        }
        self.context.remove_service_worker_process(self.id, process);
    }

    /// Handle a worker whose channel closed, cleanly or not.
    ///
    /// Unknown or already-removed processes are ignored.
    pub fn disconnect_process(&mut self, process: ProcessId) {
        let Some(worker) = self.arena.get_mut(process) else {
            tracing::debug!(process_id = %process, "Disconnect for unknown process");
            return;
        };
        let role = worker.role();
        let expected = worker.termination_requested || worker.state() == ProcessState::Terminated;
        let hosted_service_workers = worker.running_service_workers;
        worker.running_service_workers = false;
        worker.did_close();
        let reason = worker.exit_reason().unwrap_or(TerminationReason::Unknown);

        self.remove_from_containers(process);
        for supplement in self.supplements.iter_mut() {
            supplement.process_did_close(process, role);
        }
        if expected {
            tracing::debug!(process_id = %process, role = %role, "Worker exited");
            return;
        }

        self.stats.crashes += 1;
        let mut failure = WorkerFailure::new(reason);
        if hosted_service_workers {
            failure = failure.with_context("running service workers");
        }
        tracing::warn!(process_id = %process, role = %role, "{}", failure);

        match role {
            ProcessRole::Gpu => self.gpu_process_crashed(reason),
            ProcessRole::Network => self.network_process_crashed(reason),
            ProcessRole::Content => {
                self.notify_client(|c| c.content_process_crashed(process, reason))
            }
            ProcessRole::ServiceWorkerHost => {
                self.notify_client(|c| c.service_worker_process_crashed(process, reason))
            }
            ProcessRole::Plugin => {
                self.notify_client(|c| c.plugin_process_crashed(process, reason))
            }
        }
    }

    fn gpu_process_crashed(&mut self, reason: TerminationReason) {
        let content: Vec<ProcessId> = self
            .live
            .iter()
            .copied()
            .filter(|p| self.arena.get(*p).is_some_and(|w| w.role() == ProcessRole::Content))
            .collect();
        for process in &content {
            self.send_to(*process, names::GPU_PROCESS_CRASHED, &());
        }

        match self.crash_window.record_crash(self.clock.now()) {
            CrashVerdict::Tolerated { count } => {
                tracing::info!(crashes = count, reason = %reason, "GPU process crashed");
            }
            CrashVerdict::TerminateContentProcesses => {
                self.stats.gpu_crash_window_trips += 1;
                tracing::error!(
                    reason = %reason,
                    "GPU process crashed repeatedly, terminating content processes"
                );
                for process in content {
                    // Back/forward retained processes survive the sweep.
                    if !self.back_forward.holds_process(process) {
                        self.shut_down_process(process);
                    }
                }
            }
        }
        self.notify_client(|c| c.gpu_process_crashed(reason));
    }

    fn network_process_crashed(&mut self, reason: TerminationReason) {
        for supplement in self.supplements.iter_mut() {
            supplement.network_process_did_crash();
        }
        self.notify_client(|c| c.network_process_crashed(reason));
        if let Some(session) = self.automation_session.take() {
            tracing::info!(session = %session, "Ending automation session after network crash");
            self.broadcast(
                names::DESTROY_AUTOMATION_SESSION_PROXY,
                &AutomationSessionProxy { session },
                false,
            );
            self.notify_client(|c| c.automation_session_terminated(session));
        }
        // Service workers cannot run without the network worker.
        self.terminate_service_workers();
    }

    // ---------------------------------------------------------------------
    // Singletons
    // ---------------------------------------------------------------------

    /// Kill a worker's OS process without telling the pool. The exit is
    /// picked up as a crash by the next [`process_events`](Self::process_events).
    pub fn kill_process(&mut self, process: ProcessId) -> Result<()> {
        let worker = self
            .arena
            .get_mut(process)
            .ok_or(PoolError::UnknownProcess(process))?;
        tracing::info!(process_id = %process, pid = worker.pid(), "Killing worker");
        worker.kill()
    }

    pub fn ensure_network_process(&mut self) -> Result<ProcessId> {
        if let Some(network) = self.network {
            if self.is_usable(network) {
                return Ok(network);
            }
            self.disconnect_process(network);
        }
        self.create_worker_process(ProcessRole::Network, None, false)
    }

    pub fn ensure_gpu_process(&mut self) -> Result<ProcessId> {
        if !self.config.capabilities.gpu_process {
            return Err(PoolError::Config("GPU process is not available".into()));
        }
        if let Some(gpu) = self.gpu {
            if self.is_usable(gpu) {
                return Ok(gpu);
            }
            self.disconnect_process(gpu);
        }
        self.create_worker_process(ProcessRole::Gpu, None, false)
    }

    /// The plugin worker for `plugin_path`, launching it on first use.
    pub fn plugin_process_for(&mut self, plugin_path: &Path) -> Result<ProcessId> {
        if let Some(&existing) = self.plugins.get(plugin_path) {
            if self.is_usable(existing) {
                return Ok(existing);
            }
            self.disconnect_process(existing);
        }
        let mut extra = BTreeMap::new();
        extra.insert("plugin_path".to_string(), plugin_path.display().to_string());
        let process = self.launch_worker(ProcessRole::Plugin, None, false, extra)?;
        self.plugins.insert(plugin_path.to_path_buf(), process);
        if let Some(worker) = self.arena.get_mut(process) {
            worker.plugin_path = Some(plugin_path.to_path_buf());
        }
        Ok(process)
    }

    pub fn download(
        &mut self,
        data_store: DataStore,
        url: &Url,
        suggested_filename: Option<String>,
    ) -> Result<DownloadId> {
        let network = self.ensure_network_process()?;
        let id = self.context.next_download_id();
        let worker = self
            .arena
            .get_mut(network)
            .ok_or(PoolError::UnknownProcess(network))?;
        worker.send(
            names::DOWNLOAD,
            &Download {
                id,
                data_store,
                url: url.to_string(),
                suggested_filename,
            },
        )?;
        tracing::info!(download = %id, url = %url, "Download started");
        Ok(id)
    }

    // ---------------------------------------------------------------------
    // Pages and navigation
    // ---------------------------------------------------------------------

    /// Create a page. A page opened by `related_page` shares its process.
    pub fn create_page(
        &mut self,
        data_store: DataStore,
        related_page: Option<PageId>,
    ) -> Result<PageId> {
        let related = match related_page {
            Some(related) => {
                let entry = self
                    .pages
                    .get(&related)
                    .ok_or(PoolError::UnknownPage(related))?;
                Some((related, entry.process))
            }
            None => None,
        };
        let process = match related {
            Some((_, process)) if self.is_usable(process) => process,
            _ => {
                let domain = RegistrableDomain::default();
                self.process_for_registrable_domain(data_store, &domain, None)?.0
            }
        };

        let id = self.context.next_page_id();
        if let Some((related, _)) = related
            && let Some(entry) = self.pages.get_mut(&related)
        {
            entry.has_opened_windows = true;
        }
        self.pages.insert(
            id,
            Page {
                id,
                process,
                data_store,
                url: None,
                committed: false,
                opened_by_script_with_opener: related.is_some(),
                has_opened_windows: false,
            },
        );
        self.routes
            .add_scoped_receiver(receivers::PAGE, id.0, Route::Page(id));
        self.attach_page(id, process, data_store);
        self.page_begin_using_data_store(id, data_store);

        tracing::debug!(page = %id, process_id = %process, "Created page");
        Ok(id)
    }

    fn attach_page(&mut self, page: PageId, process: ProcessId, data_store: DataStore) {
        self.arena.retain(process);
        let mut foreground = false;
        if let Some(worker) = self.arena.get_mut(process) {
            if worker.data_store.is_none() {
                worker.data_store = Some(data_store);
            }
            worker.pages.insert(page);
            foreground = worker.pages.len() == 1;
        }
        if foreground {
            self.notify_client(|c| c.process_priority_changed(process, true));
        }
    }

    /// Take `page` off `source`, leaving a suspended page behind when
    /// back/forward retention allows.
    fn detach_page(&mut self, page: &Page, source: ProcessId) -> Option<SuspendedPageId> {
        let usable = self.is_usable(source);
        let mut source_domain = RegistrableDomain::default();
        if let Some(worker) = self.arena.get_mut(source) {
            worker.pages.remove(&page.id);
            source_domain = worker.registrable_domain().clone();
        }

        let mut created = None;
        if usable && page.committed && self.back_forward.capacity() > 0 {
            let id = self.context.next_suspended_page_id();
            self.arena.retain(source);
            if let Some(worker) = self.arena.get_mut(source) {
                worker.suspended_pages.insert(id);
            }
            let evicted = self.back_forward.add(SuspendedPage {
                id,
                page: page.id,
                process: source,
                domain: source_domain.clone(),
                data_store: page.data_store.id,
                url: page.url.clone(),
            });
            created = Some(id);
            tracing::debug!(suspended = %id, process_id = %source, "Suspended page");
            for old in evicted {
                self.drop_suspended_page(old);
            }
        } else if usable {
            self.send_to(source, names::CLOSE_PAGE, &ClosePage { page: page.id });
        }

        if self.config.always_keep_and_reuse_swapped_processes && usable && !source_domain.is_empty()
        {
            self.retained_swapped.insert(source_domain, source);
        }
        self.arena.release(source);
        created
    }

    /// Forget a suspended page without running the idle policy on its process.
    fn discard_suspended_page(&mut self, suspended: SuspendedPage, close_in_worker: bool) {
        if let Some(worker) = self.arena.get_mut(suspended.process) {
            worker.suspended_pages.remove(&suspended.id);
        }
        let page_lives_there = self
            .pages
            .get(&suspended.page)
            .is_some_and(|p| p.process == suspended.process);
        if close_in_worker && !page_lives_there {
            self.send_to(
                suspended.process,
                names::CLOSE_PAGE,
                &ClosePage {
                    page: suspended.page,
                },
            );
        }
        self.arena.release(suspended.process);
    }

    fn drop_suspended_page(&mut self, suspended: SuspendedPage) {
        let process = suspended.process;
        self.discard_suspended_page(suspended, true);
        self.maybe_shut_down(process);
    }

    fn selection_inputs<'a>(
        &self,
        page: &'a Page,
        request: &'a NavigationRequest,
        target_domain: &RegistrableDomain,
    ) -> SelectionInputs<'a> {
        let source = self.arena.get(page.process);
        let item = request.back_forward_item.unwrap_or_default();

        let valid_suspended_page = item.suspended_page.filter(|id| {
            self.back_forward
                .get(*id)
                .is_some_and(|s| self.is_usable(s.process))
        });
        let live_history_process = item.process.filter(|id| {
            self.arena
                .get(*id)
                .is_some_and(|p| p.role() == ProcessRole::Content && p.is_usable())
        });
        let retained_swapped_process = if self.config.always_keep_and_reuse_swapped_processes {
            self.retained_swapped
                .get(target_domain)
                .copied()
                .filter(|id| {
                    *id != page.process
                        && self.arena.get(*id).is_some_and(|p| {
                            p.is_usable() && p.data_store().map(|s| s.id) == Some(page.data_store.id)
                        })
                })
        } else {
            None
        };

        SelectionInputs {
            single_process: self.config.uses_single_process,
            requested_swap: request.requested_swap,
            swap_on_navigation: self.config.process_swaps_on_navigation,
            automation_session: self.automation_session.is_some(),
            source_has_committed_load: source.is_some_and(|p| p.has_committed_provisional_load()),
            script_related_window: !self.config.process_swaps_on_window_open_with_opener
                && (page.opened_by_script_with_opener || page.has_opened_windows),
            valid_suspended_page,
            live_history_process,
            same_origin_marker: request.same_origin_marker,
            source_url: page.url.as_ref(),
            target_url: &request.target_url,
            retained_swapped_process,
        }
    }

    /// Pick the process for a navigation and start the load there.
    pub fn navigate(
        &mut self,
        page: PageId,
        request: NavigationRequest,
    ) -> Result<NavigationResult> {
        let current = self
            .pages
            .get(&page)
            .cloned()
            .ok_or(PoolError::UnknownPage(page))?;
        let source = current.process;
        let data_store = current.data_store;
        let target_domain = RegistrableDomain::from_url(&request.target_url);

        let decision = if self.is_usable(source) {
            selector::decide(&self.selection_inputs(&current, &request, &target_domain))
        } else {
            Decision::SelectByDomain(SelectionReason::SourceProcessTerminated)
        };

        let mut suspended_page_used = None;
        let (process, source_kind, reason) = match decision {
            Decision::ReuseSource(reason) => {
                if reason == SelectionReason::NoCommittedLoad {
                    self.forward_prewarm_information(source, &target_domain);
                }
                (source, ProcessSource::Source, reason)
            }
            Decision::UseSuspendedPage(id) => match self.back_forward.take(id) {
                Some(suspended) => {
                    let process = suspended.process;
                    self.discard_suspended_page(suspended, false);
                    suspended_page_used = Some(id);
                    (
                        process,
                        ProcessSource::SuspendedPage,
                        SelectionReason::BackForwardSuspendedPage,
                    )
                }
                None => {
                    let (process, kind) = self.process_for_registrable_domain(
                        data_store,
                        &target_domain,
                        Some(source),
                    )?;
                    (process, kind, SelectionReason::CrossSite)
                }
            },
            Decision::UseHistoryProcess(process) => {
                self.remove_cached_process(process, ShutdownPolicy::KeepAlive);
                (
                    process,
                    ProcessSource::BackForwardProcess,
                    SelectionReason::BackForwardProcess,
                )
            }
            Decision::UseRetainedProcess(process) => {
                self.retained_swapped.remove(&target_domain);
                self.remove_cached_process(process, ShutdownPolicy::KeepAlive);
                (process, ProcessSource::RetainedSwapped, SelectionReason::CrossSite)
            }
            Decision::SelectByDomain(reason) => {
                if reason == SelectionReason::CrossSite
                    && self.config.automatic_process_warming.is_none()
                {
                    self.client_would_benefit_from_prewarming = true;
                }
                let (process, kind) = self.process_for_registrable_domain(
                    data_store,
                    &target_domain,
                    Some(source),
                )?;
                (process, kind, reason)
            }
        };

        let swapped = process != source;
        let mut suspended_page_created = None;
        if swapped {
            suspended_page_created = self.detach_page(&current, source);
            self.attach_page(page, process, data_store);
            if let Some(entry) = self.pages.get_mut(&page) {
                entry.process = process;
                entry.committed = false;
            }
            self.stats.process_swaps += 1;
            self.maybe_shut_down(source);
        }
        self.stats.navigations += 1;

        tracing::info!(
            page = %page,
            url = %request.target_url,
            from = %source,
            to = %process,
            reason = %reason,
            swapped,
            "Selected process for navigation"
        );

        let load = LoadUrl {
            page,
            url: request.target_url.to_string(),
            data_store,
        };
        if let Some(worker) = self.arena.get_mut(process)
            && let Err(e) = worker.send(names::LOAD_URL, &load)
        {
            tracing::warn!(process_id = %process, error = %e, "Could not start load");
        }

        Ok(NavigationResult {
            process,
            previous_process: source,
            swapped,
            reason,
            source: source_kind,
            suspended_page_created,
            suspended_page_used,
        })
    }

    /// Record a committed load. Commits from a process the page already left
    /// are ignored.
    pub fn did_commit_load(&mut self, process: ProcessId, page: PageId, url: Url) {
        let Some(entry) = self.pages.get_mut(&page) else {
            tracing::debug!(page = %page, "Commit for unknown page");
            return;
        };
        if entry.process != process {
            tracing::debug!(page = %page, process_id = %process, "Ignoring commit from stale process");
            return;
        }
        entry.url = Some(url.clone());
        entry.committed = true;

        if let Some(worker) = self.arena.get_mut(process) {
            worker.has_committed_provisional_load = true;
            let domain = RegistrableDomain::from_url(&url);
            if !domain.is_empty() {
                worker.registrable_domain = domain;
            }
        }
        tracing::debug!(page = %page, process_id = %process, url = %url, "Committed load");
    }

    pub fn close_page(&mut self, page: PageId) -> Result<()> {
        let entry = self
            .pages
            .remove(&page)
            .ok_or(PoolError::UnknownPage(page))?;
        self.routes.remove_scoped_receiver(receivers::PAGE, page.0);

        self.send_to(entry.process, names::CLOSE_PAGE, &ClosePage { page });
        if let Some(worker) = self.arena.get_mut(entry.process) {
            worker.pages.remove(&page);
        }
        for suspended in self.back_forward.remove_for_page(page) {
            self.drop_suspended_page(suspended);
        }
        self.arena.release(entry.process);
        self.page_end_using_data_store(page, entry.data_store.id);
        self.maybe_shut_down(entry.process);

        tracing::debug!(page = %page, process_id = %entry.process, "Closed page");
        Ok(())
    }

    pub fn page_begin_using_data_store(&mut self, page: PageId, data_store: DataStore) {
        self.data_store_pages
            .entry(data_store.id)
            .or_insert_with(|| DataStorePages {
                store: data_store,
                pages: BTreeSet::new(),
            })
            .pages
            .insert(page);
    }

    /// When the last page of an ephemeral store goes away, its cached
    /// processes are evicted.
    pub fn page_end_using_data_store(&mut self, page: PageId, data_store: DataStoreId) {
        let Some(entry) = self.data_store_pages.get_mut(&data_store) else {
            return;
        };
        entry.pages.remove(&page);
        if !entry.pages.is_empty() {
            return;
        }
        let store = entry.store;
        self.data_store_pages.remove(&data_store);

        if store.ephemeral {
            let evicted = self.cache.remove_for_data_store(data_store);
            tracing::debug!(
                store = %data_store,
                evicted = evicted.len(),
                "Ephemeral data store no longer in use"
            );
            for process in evicted {
                self.arena.release(process);
                self.terminate_if_idle(process);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Memory pressure and prewarming
    // ---------------------------------------------------------------------

    pub fn handle_memory_pressure_warning(&mut self) {
        self.handle_memory_pressure(false);
    }

    /// Release memory: back/forward retention, then the Process Cache, then
    /// the prewarmed process.
    pub fn handle_memory_pressure(&mut self, critical: bool) {
        tracing::info!(
            critical,
            suspended = self.back_forward.len(),
            cached = self.cache.len(),
            "Handling memory pressure"
        );

        // Processes freed here flow into the cache, which is cleared next.
        for suspended in self.back_forward.clear() {
            self.drop_suspended_page(suspended);
        }
        for process in self.cache.clear() {
            self.arena.release(process);
            self.terminate_if_idle(process);
        }
        self.prewarm_timer.stop();
        if let Some(process) = self.prewarmed.take() {
            self.shut_down_process(process);
        }

        self.broadcast(
            names::MEMORY_PRESSURE_EVENT,
            &MemoryPressureEvent { critical },
            true,
        );
    }

    pub fn is_automatic_warming_enabled(&self) -> bool {
        self.config
            .automatic_process_warming
            .unwrap_or(self.client_would_benefit_from_prewarming)
    }

    /// Launch the prewarmed process now. Single-process pools never prewarm.
    pub fn prewarm_process(&mut self) -> Result<Option<ProcessId>> {
        if let Some(process) = self.prewarmed {
            if self.is_usable(process) {
                return Ok(Some(process));
            }
            self.prewarmed = None;
        }
        if self.config.uses_single_process {
            return Ok(None);
        }
        let store = DataStore::persistent(self.config.primary_data_store.0);
        let process = self.create_worker_process(ProcessRole::Content, Some(store), true)?;
        tracing::debug!(process_id = %process, "Prewarmed process");
        Ok(Some(process))
    }

    /// The embedder is idle; schedule a prewarm if warming applies.
    pub fn did_reach_good_time_to_prewarm(&mut self) {
        if !self.is_automatic_warming_enabled()
            || !self.config.process_swaps_on_navigation
            || self.config.uses_single_process
            || self.memory_monitor.is_under_pressure()
            || self.prewarmed.is_some()
        {
            return;
        }
        if self.config.prewarm_delay.is_zero() {
            if let Err(e) = self.prewarm_process() {
                tracing::warn!(error = %e, "Prewarm failed");
            }
            return;
        }
        if !self.prewarm_timer.is_active() {
            self.prewarm_timer
                .start_one_shot(self.clock.now(), self.config.prewarm_delay);
        }
    }

    fn forward_prewarm_information(&mut self, process: ProcessId, domain: &RegistrableDomain) {
        if domain.is_empty() {
            return;
        }
        let Some(information) = self.prewarm_info.get(domain).cloned() else {
            return;
        };
        self.send_to(
            process,
            names::PREWARM_WITH_DOMAIN_INFORMATION,
            &DomainPrewarmInformation {
                domain: domain.clone(),
                information,
            },
        );
    }

    pub fn prewarm_information(&self) -> &PrewarmInformationStore {
        &self.prewarm_info
    }

    // ---------------------------------------------------------------------
    // Service workers, gamepads, automation
    // ---------------------------------------------------------------------

    /// Host service workers for (domain, data store).
    ///
    /// A live content process of that domain is reused unless a separate
    /// service-worker process is configured.
    pub fn establish_service_worker_context(
        &mut self,
        domain: &RegistrableDomain,
        data_store: DataStore,
    ) -> Result<ProcessId> {
        if !self.config.capabilities.service_workers {
            return Err(PoolError::Config("service workers are disabled".into()));
        }
        self.ensure_network_process()?;

        let separate = self.config.use_separate_service_worker_process;
        let reusable = self.live.iter().copied().find(|id| {
            self.arena.get(*id).is_some_and(|p| {
                p.is_usable()
                    && !domain.is_empty()
                    && p.registrable_domain() == domain
                    && p.data_store().map(|s| s.id) == Some(data_store.id)
                    && match p.role() {
                        ProcessRole::ServiceWorkerHost => true,
                        ProcessRole::Content => !separate,
                        _ => false,
                    }
            })
        });

        let process = match reusable {
            Some(process) => {
                self.remove_cached_process(process, ShutdownPolicy::KeepAlive);
                process
            }
            None => self.create_worker_process(
                ProcessRole::ServiceWorkerHost,
                Some(data_store),
                false,
            )?,
        };
        if let Some(worker) = self.arena.get_mut(process) {
            worker.running_service_workers = true;
            if worker.registrable_domain.is_empty() {
                worker.registrable_domain = domain.clone();
            }
        }
        self.send_to(process, names::ENABLE_SERVICE_WORKERS, &());
        self.context.add_service_worker_process(self.id, process);

        tracing::info!(process_id = %process, domain = %domain, "Service worker context established");
        Ok(process)
    }

    pub fn terminate_service_workers(&mut self) {
        let hosts: Vec<(ProcessId, ProcessRole)> = self
            .live
            .iter()
            .filter_map(|id| self.arena.get(*id))
            .filter(|p| p.running_service_workers)
            .map(|p| (p.id(), p.role()))
            .collect();

        for (process, role) in hosts {
            if let Some(worker) = self.arena.get_mut(process) {
                worker.running_service_workers = false;
            }
            self.send_to(process, names::DISABLE_SERVICE_WORKERS, &());
            self.context.remove_service_worker_process(self.id, process);
            if role == ProcessRole::ServiceWorkerHost {
                self.shut_down_process(process);
            } else {
                self.maybe_shut_down(process);
            }
        }
    }

    pub fn started_using_gamepads(&mut self, process: ProcessId) {
        if !self.config.capabilities.gamepads || !self.arena.contains(process) {
            return;
        }
        let first = self.gamepad_processes.is_empty();
        if self.gamepad_processes.insert(process) {
            if let Some(worker) = self.arena.get_mut(process) {
                worker.uses_gamepads = true;
            }
            if first {
                self.notify_client(|c| c.started_using_gamepads());
            }
        }
    }

    pub fn stopped_using_gamepads(&mut self, process: ProcessId) {
        if !self.gamepad_processes.remove(&process) {
            return;
        }
        if let Some(worker) = self.arena.get_mut(process) {
            worker.uses_gamepads = false;
        }
        if self.gamepad_processes.is_empty() {
            self.notify_client(|c| c.stopped_using_gamepads());
        }
    }

    pub fn set_automation_session(&mut self, session: Option<AutomationSessionId>) {
        if self.automation_session == session {
            return;
        }
        if let Some(previous) = self.automation_session.take() {
            self.broadcast(
                names::DESTROY_AUTOMATION_SESSION_PROXY,
                &AutomationSessionProxy { session: previous },
                false,
            );
        }
        self.automation_session = session;
        if let Some(session) = session {
            self.broadcast(
                names::ENSURE_AUTOMATION_SESSION_PROXY,
                &AutomationSessionProxy { session },
                false,
            );
        }
    }

    // ---------------------------------------------------------------------
    // Settings
    // ---------------------------------------------------------------------

    pub fn set_process_swaps_on_navigation(&mut self, enabled: bool) {
        self.config.process_swaps_on_navigation = enabled;
        self.update_cache_capacities();
    }

    pub fn set_cache_model(&mut self, model: CacheModel) {
        self.apply_cache_model(model);
        self.broadcast(names::SET_CACHE_MODEL, &SetCacheModel { model }, true);
    }

    /// Apply a cache model after the network worker confirmed it.
    pub fn set_cache_model_synchronously_for_testing(&mut self, model: CacheModel) -> Result<()> {
        let network = self.ensure_network_process()?;
        let timeout = self.config.sync_message_timeout;
        let worker = self
            .arena
            .get_mut(network)
            .ok_or(PoolError::UnknownProcess(network))?;
        worker.send_sync(
            names::SET_CACHE_MODEL_SYNCHRONOUSLY,
            &SetCacheModel { model },
            timeout,
        )?;
        self.apply_cache_model(model);
        self.broadcast(names::SET_CACHE_MODEL, &SetCacheModel { model }, false);
        Ok(())
    }

    fn apply_cache_model(&mut self, model: CacheModel) {
        self.config.cache_model = model;
        self.update_cache_capacities();
    }

    fn update_cache_capacities(&mut self) {
        let memory = self.system_memory_mib;
        let capacity = self.config.process_cache_capacity(memory);
        for process in self.cache.set_capacity(capacity) {
            self.arena.release(process);
            self.terminate_if_idle(process);
        }
        let capacity = self.config.back_forward_capacity(memory);
        for suspended in self.back_forward.set_capacity(capacity) {
            self.drop_suspended_page(suspended);
        }
        tracing::debug!(
            process_cache = self.cache.capacity(),
            back_forward = self.back_forward.capacity(),
            "Updated cache capacities"
        );
    }

    pub fn register_url_scheme(&mut self, scheme: &str, kind: UrlSchemeKind) -> Result<()> {
        let scheme = scheme.trim().to_ascii_lowercase();
        if scheme.is_empty() {
            return Err(PoolError::Config("URL scheme must not be empty".into()));
        }
        let registration = UrlSchemeRegistration { scheme, kind };
        if !self.config.url_schemes.contains(&registration) {
            self.config.url_schemes.push(registration.clone());
        }
        self.broadcast(names::REGISTER_URL_SCHEME, &registration, true);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Diagnostics
    // ---------------------------------------------------------------------

    pub fn statistics(&self) -> PoolStatistics {
        let mut stats = self.stats.clone();
        stats.live_processes = self.live.iter().filter(|p| self.is_usable(**p)).count();
        stats.cached_processes = self.cache.len();
        stats.suspended_pages = self.back_forward.len();
        stats.pages = self.pages.len();
        stats
    }

    /// Ask a worker for the origins of its pages. `callback` runs once, with
    /// an empty list if the worker goes away first.
    pub fn active_pages_origins_in_process_for_testing(
        &mut self,
        process: ProcessId,
        callback: impl FnOnce(Vec<String>) + 'static,
    ) {
        let handler = ReplyHandler::new(move |reply| {
            let origins = reply
                .and_then(|value| serde_json::from_value(value).ok())
                .unwrap_or_default();
            callback(origins);
        });
        match self.arena.get_mut(process) {
            Some(worker) => worker.send_with_async_reply(names::ACTIVE_PAGES_ORIGINS, handler),
            None => handler.complete(None),
        }
    }

    // ---------------------------------------------------------------------
    // Message dispatch
    // ---------------------------------------------------------------------

    pub fn add_message_receiver(&mut self, name: &str, receiver: SharedReceiver) {
        self.routes.add_receiver(name, Route::External(receiver));
    }

    pub fn add_scoped_message_receiver(
        &mut self,
        name: &str,
        destination: u64,
        receiver: SharedReceiver,
    ) {
        self.routes
            .add_scoped_receiver(name, destination, Route::External(receiver));
    }

    pub fn remove_message_receiver(&mut self, name: &str) {
        self.routes.remove_receiver(name);
    }

    /// Drain every connection, dispatch what arrived, handle closed
    /// channels, fire due timers and reclaim dead records.
    ///
    /// Returns the number of messages dispatched.
    pub fn process_events(&mut self) -> usize {
        let mut batches = Vec::new();
        let mut closed = Vec::new();
        for id in self.arena.ids() {
            let Some(worker) = self.arena.get_mut(id) else {
                continue;
            };
            if worker.state() == ProcessState::Terminated {
                continue;
            }
            let incoming = worker.connection_mut().poll();
            self.stats.malformed_messages += incoming.malformed;
            self.stats.unroutable_messages += incoming.stray_replies;
            if incoming.closed {
                closed.push(id);
            }
            if !incoming.messages.is_empty() {
                batches.push((id, incoming.messages));
            }
        }

        let mut dispatched = 0;
        for (from, messages) in batches {
            for message in messages {
                self.dispatch_message(from, message);
                dispatched += 1;
            }
        }
        for id in closed {
            self.disconnect_process(id);
        }

        self.fire_timers();
        for id in self.arena.collect() {
            tracing::trace!(process_id = %id, "Worker record reclaimed");
        }
        dispatched
    }

    fn dispatch_message(&mut self, from: ProcessId, message: Envelope) {
        let reply = match self.routes.lookup(&message) {
            Some(Route::Pool) => {
                self.did_receive_pool_message(from, &message);
                Value::Null
            }
            Some(Route::Page(page)) => {
                self.did_receive_page_message(from, page, &message);
                Value::Null
            }
            Some(Route::External(receiver)) => match receiver.try_borrow_mut() {
                Ok(mut target) if message.expects_reply() => {
                    target.did_receive_sync_message(from, &message)
                }
                Ok(mut target) => {
                    target.did_receive_message(from, &message);
                    Value::Null
                }
                Err(_) => {
                    tracing::warn!(message = %message.name, "Receiver busy, dropping message");
                    Value::Null
                }
            },
            None => {
                self.unroutable(from, &message);
                Value::Null
            }
        };

        if message.expects_reply()
            && let Some(worker) = self.arena.get_mut(from)
            && let Err(e) = worker.connection_mut().send_reply(&message, reply)
        {
            tracing::debug!(process_id = %from, error = %e, "Reply failed");
        }
    }

    fn unroutable(&mut self, from: ProcessId, message: &Envelope) {
        self.stats.unroutable_messages += 1;
        tracing::warn!(
            process_id = %from,
            receiver = %message.receiver,
            destination = ?message.destination,
            message = %message.name,
            "Dropping unroutable message"
        );
    }

    fn malformed(&mut self, from: ProcessId, message: &Envelope, error: PoolError) {
        self.stats.malformed_messages += 1;
        tracing::warn!(
            process_id = %from,
            message = %message.name,
            error = %error,
            "Dropping malformed message"
        );
    }

    fn did_receive_pool_message(&mut self, from: ProcessId, message: &Envelope) {
        match message.name.as_str() {
            names::DID_FINISH_LAUNCHING => {
                if let Some(worker) = self.arena.get_mut(from) {
                    worker.did_finish_launching();
                    tracing::debug!(process_id = %from, pid = worker.pid(), "Worker finished launching");
                }
            }
            names::DID_COLLECT_PREWARM_INFORMATION => {
                match message.body_as::<DomainPrewarmInformation>() {
                    Ok(info) => self.prewarm_info.record(info.domain, info.information),
                    Err(e) => self.malformed(from, message, e),
                }
            }
            names::STARTED_USING_GAMEPADS => self.started_using_gamepads(from),
            names::STOPPED_USING_GAMEPADS => self.stopped_using_gamepads(from),
            _ => self.unroutable(from, message),
        }
    }

    fn did_receive_page_message(&mut self, from: ProcessId, page: PageId, message: &Envelope) {
        match message.name.as_str() {
            names::DID_COMMIT_LOAD => {
                let url = message
                    .body_as::<DidCommitLoad>()
                    .and_then(|commit| Url::parse(&commit.url).map_err(PoolError::from));
                match url {
                    Ok(url) => self.did_commit_load(from, page, url),
                    Err(e) => self.malformed(from, message, e),
                }
            }
            _ => self.unroutable(from, message),
        }
    }

    fn fire_timers(&mut self) {
        let now = self.clock.now();
        self.crash_window.poll(now);

        if self.prewarm_timer.fire_if_due(now)
            && let Err(e) = self.prewarm_process()
        {
            tracing::warn!(error = %e, "Prewarm failed");
        }

        for process in self.cache.take_expired(now) {
            tracing::debug!(process_id = %process, "Cached process expired");
            self.arena.release(process);
            self.terminate_if_idle(process);
        }

        if let Some(critical) = self.memory_monitor.poll(now) {
            self.handle_memory_pressure(critical);
        }
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Stop every worker and unregister the pool. Idempotent.
    pub fn shut_down(&mut self) {
        if self.is_shut_down {
            return;
        }
        self.is_shut_down = true;
        tracing::info!(pool = %self.id, workers = self.arena.len(), "Shutting down pool");

        self.prewarm_timer.stop();
        for id in self.arena.ids() {
            if let Some(worker) = self.arena.get_mut(id) {
                worker.shut_down();
            }
        }
        self.live.clear();
        self.network = None;
        self.gpu = None;
        self.plugins.clear();
        self.prewarmed = None;
        self.cache.clear();
        self.back_forward.clear();
        self.retained_swapped.clear();
        self.pages.clear();
        self.data_store_pages.clear();
        self.gamepad_processes.clear();
        self.context.unregister_pool(self.id);
        drop(self.arena.drain());
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.shut_down();
    }
}
