//! Scripted navigation runs against a live pool.
//!
//! A script is a JSON document with an optional pool configuration and a
//! list of steps. Pages are named by the script; every step produces one
//! JSON line describing what the pool did, followed by a final statistics
//! line.
//!
//! ```json
//! {
//!   "config": { "maximum_process_cache_size": 1, "uses_back_forward_cache": false },
//!   "steps": [
//!     { "op": "create_page", "page": "tab" },
//!     { "op": "navigate", "page": "tab", "url": "https://a.example/" },
//!     { "op": "navigate", "page": "tab", "url": "https://b.example/" },
//!     { "op": "memory_pressure", "critical": true }
//!   ]
//! }
//! ```

use crate::config::PoolConfiguration;
use crate::error::{PoolError, Result};
use crate::pool::{
    BackForwardItem, NavigationRequest, NavigationResult, PoolHandle, PoolStatistics,
};
use crate::types::{DataStore, PageId, ProcessId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};
use url::Url;

/// How long to wait for a worker to report a commit or an exit.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    #[serde(default)]
    pub config: Option<PoolConfiguration>,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PoolError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    CreatePage {
        page: String,
        #[serde(default)]
        data_store: Option<DataStore>,
        /// Name of the page that opened this one.
        #[serde(default)]
        opener: Option<String>,
    },
    Navigate {
        page: String,
        url: Url,
        #[serde(default)]
        requested_swap: bool,
        #[serde(default)]
        same_origin: bool,
        /// Go back to the page's most recent suspended page, if any.
        #[serde(default)]
        back: bool,
    },
    ClosePage {
        page: String,
    },
    MemoryPressure {
        #[serde(default)]
        critical: bool,
    },
    Prewarm,
    CrashGpu,
}

impl Step {
    fn op(&self) -> &'static str {
        match self {
            Self::CreatePage { .. } => "create_page",
            Self::Navigate { .. } => "navigate",
            Self::ClosePage { .. } => "close_page",
            Self::MemoryPressure { .. } => "memory_pressure",
            Self::Prewarm => "prewarm",
            Self::CrashGpu => "crash_gpu",
        }
    }
}

/// One output line.
#[derive(Debug, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation: Option<NavigationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed: Option<bool>,
    pub cached_processes: usize,
    pub suspended_pages: usize,
}

#[derive(Debug, Serialize)]
struct FinalReport<'a> {
    statistics: &'a PoolStatistics,
}

/// Drives a pool through a script.
pub struct Simulation {
    pool: PoolHandle,
    pages: HashMap<String, PageId>,
    /// Suspended pages left behind by each page, most recent last.
    history: HashMap<PageId, Vec<BackForwardItem>>,
    default_store: DataStore,
    event_timeout: Duration,
}

impl Simulation {
    pub fn new(pool: PoolHandle) -> Self {
        let default_store = DataStore::persistent(pool.borrow().configuration().primary_data_store.0);
        Self {
            pool,
            pages: HashMap::new(),
            history: HashMap::new(),
            default_store,
            event_timeout: DEFAULT_EVENT_TIMEOUT,
        }
    }

    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    /// Run every step, writing one JSON line per step and a final statistics
    /// line to `out`.
    pub fn run(&mut self, steps: &[Step], out: &mut impl Write) -> Result<PoolStatistics> {
        for (index, step) in steps.iter().enumerate() {
            tracing::debug!(step = index, op = step.op(), "Running step");
            let report = self.run_step(index, step)?;
            writeln!(out, "{}", serde_json::to_string(&report)?)?;
        }
        let statistics = self.pool.borrow().statistics();
        writeln!(
            out,
            "{}",
            serde_json::to_string(&FinalReport {
                statistics: &statistics
            })?
        )?;
        Ok(statistics)
    }

    fn page(&self, name: &str) -> Result<PageId> {
        self.pages
            .get(name)
            .copied()
            .ok_or_else(|| PoolError::Config(format!("Script uses unknown page '{}'", name)))
    }

    fn run_step(&mut self, index: usize, step: &Step) -> Result<StepReport> {
        let mut report = StepReport {
            step: index,
            op: step.op(),
            page: None,
            process: None,
            navigation: None,
            committed: None,
            cached_processes: 0,
            suspended_pages: 0,
        };

        match step {
            Step::CreatePage {
                page,
                data_store,
                opener,
            } => {
                let opener = opener.as_deref().map(|name| self.page(name)).transpose()?;
                let store = data_store.unwrap_or(self.default_store);
                let id = self.pool.borrow_mut().create_page(store, opener)?;
                self.pages.insert(page.clone(), id);
                report.page = Some(page.clone());
                report.process = self.pool.borrow().page_process(id);
            }
            Step::Navigate {
                page,
                url,
                requested_swap,
                same_origin,
                back,
            } => {
                let id = self.page(page)?;
                let mut request = NavigationRequest::new(url.clone())
                    .with_requested_swap(*requested_swap)
                    .with_same_origin_marker(*same_origin);
                if *back && let Some(item) = self.history.get_mut(&id).and_then(|h| h.pop()) {
                    request = request.with_back_forward_item(item);
                }

                let result = self.pool.borrow_mut().navigate(id, request)?;
                if let Some(suspended) = result.suspended_page_created {
                    self.history.entry(id).or_default().push(BackForwardItem {
                        suspended_page: Some(suspended),
                        process: Some(result.previous_process),
                    });
                }
                report.committed = Some(self.wait_for_commit(id, url));
                report.page = Some(page.clone());
                report.process = Some(result.process);
                report.navigation = Some(result);
            }
            Step::ClosePage { page } => {
                let id = self.page(page)?;
                report.process = self.pool.borrow().page_process(id);
                self.pool.borrow_mut().close_page(id)?;
                self.pages.remove(page);
                self.history.remove(&id);
                report.page = Some(page.clone());
            }
            Step::MemoryPressure { critical } => {
                self.pool.borrow_mut().handle_memory_pressure(*critical);
            }
            Step::Prewarm => {
                report.process = self.pool.borrow_mut().prewarm_process()?;
            }
            Step::CrashGpu => {
                let gpu = self.pool.borrow_mut().ensure_gpu_process()?;
                self.pool.borrow_mut().kill_process(gpu)?;
                self.wait_until(|pool| pool.borrow().gpu_process() != Some(gpu));
                report.process = Some(gpu);
            }
        }

        self.pool.borrow_mut().process_events();
        let pool = self.pool.borrow();
        report.cached_processes = pool.process_cache().len();
        report.suspended_pages = pool.back_forward_cache().len();
        Ok(report)
    }

    fn wait_for_commit(&self, page: PageId, url: &Url) -> bool {
        let committed = self.wait_until(|pool| pool.borrow().page_url(page) == Some(url));
        if !committed {
            tracing::warn!(page = %page, url = %url, "Load did not commit in time");
        }
        committed
    }

    /// Pump events until `done` holds or the event timeout runs out.
    fn wait_until(&self, done: impl Fn(&PoolHandle) -> bool) -> bool {
        let deadline = Instant::now() + self.event_timeout;
        loop {
            self.pool.borrow_mut().process_events();
            if done(&self.pool) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
