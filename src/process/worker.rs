//! Orchestrator-side record of one worker process.

use super::launcher::LaunchedWorker;
use super::proc::OsProcess;
use super::signals::TerminationReason;
use crate::domain::RegistrableDomain;
use crate::error::Result;
use crate::ipc::connection::{Connection, ReplyHandler};
use crate::ipc::protocol::{Envelope, names, receivers};
use crate::types::{DataStore, PageId, ProcessId, ProcessRole, SuspendedPageId};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Spawned; the handshake has not arrived yet.
    Launching,
    Running,
    Terminated,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launching => f.write_str("launching"),
            Self::Running => f.write_str("running"),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

pub struct WorkerProcess {
    id: ProcessId,
    role: ProcessRole,
    pid: u32,
    state: ProcessState,
    connection: Connection,
    os: Box<dyn OsProcess>,
    launched_at: Instant,
    exit_reason: Option<TerminationReason>,

    pub(crate) data_store: Option<DataStore>,
    /// Registrable domain of the last committed load; empty until then.
    pub(crate) registrable_domain: RegistrableDomain,
    pub(crate) prewarmed: bool,
    pub(crate) has_committed_provisional_load: bool,
    pub(crate) pages: BTreeSet<PageId>,
    pub(crate) suspended_pages: BTreeSet<SuspendedPageId>,
    pub(crate) running_service_workers: bool,
    pub(crate) uses_gamepads: bool,
    pub(crate) termination_requested: bool,
    pub(crate) plugin_path: Option<PathBuf>,
}

impl WorkerProcess {
    pub fn new(
        id: ProcessId,
        role: ProcessRole,
        launched: LaunchedWorker,
        data_store: Option<DataStore>,
        prewarmed: bool,
        now: Instant,
    ) -> Self {
        Self {
            id,
            role,
            pid: launched.pid,
            state: ProcessState::Launching,
            connection: Connection::new(id, launched.transport),
            os: launched.os,
            launched_at: now,
            exit_reason: None,
            data_store,
            registrable_domain: RegistrableDomain::default(),
            prewarmed,
            has_committed_provisional_load: false,
            pages: BTreeSet::new(),
            suspended_pages: BTreeSet::new(),
            running_service_workers: false,
            uses_gamepads: false,
            termination_requested: false,
            plugin_path: None,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn data_store(&self) -> Option<DataStore> {
        self.data_store
    }

    pub fn registrable_domain(&self) -> &RegistrableDomain {
        &self.registrable_domain
    }

    pub fn is_prewarmed(&self) -> bool {
        self.prewarmed
    }

    pub fn has_committed_provisional_load(&self) -> bool {
        self.has_committed_provisional_load
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn suspended_page_count(&self) -> usize {
        self.suspended_pages.len()
    }

    pub fn exit_reason(&self) -> Option<TerminationReason> {
        self.exit_reason
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.launched_at)
    }

    /// Not terminated and its channel is open.
    pub fn is_usable(&self) -> bool {
        self.state != ProcessState::Terminated && self.connection.is_valid()
    }

    /// Hosts nothing that needs it to stay alive.
    pub fn is_idle(&self) -> bool {
        self.pages.is_empty()
            && self.suspended_pages.is_empty()
            && !self.running_service_workers
            && !self.prewarmed
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Send a fire-and-forget message to the worker's `Process` receiver.
    pub fn send<T: Serialize>(&mut self, name: &str, body: &T) -> Result<()> {
        let message = Envelope::with_body(receivers::PROCESS, name, body)?;
        self.connection.send(message)
    }

    pub fn send_sync<T: Serialize>(
        &mut self,
        name: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<Value> {
        let message = Envelope::with_body(receivers::PROCESS, name, body)?;
        self.connection.send_sync(message, timeout)
    }

    pub fn send_with_async_reply(&mut self, name: &str, handler: ReplyHandler) {
        let message = Envelope::new(receivers::PROCESS, name);
        self.connection.send_with_async_reply(message, handler);
    }

    pub(crate) fn did_finish_launching(&mut self) {
        if self.state == ProcessState::Launching {
            self.state = ProcessState::Running;
        }
    }

    /// Ask the worker to exit and stop talking to it.
    pub(crate) fn shut_down(&mut self) {
        if self.state == ProcessState::Terminated {
            return;
        }
        self.termination_requested = true;
        if self.connection.is_valid() {
            let _ = self.connection.send(Envelope::new(receivers::PROCESS, names::EXIT));
        }
        self.connection.invalidate();
        if let Err(e) = self.os.terminate() {
            tracing::debug!(process_id = %self.id, error = %e, "Terminate failed");
        }
        self.state = ProcessState::Terminated;
    }

    /// Force the OS process down (used for crash testing).
    pub(crate) fn kill(&mut self) -> Result<()> {
        self.os.kill()
    }

    /// Record that the channel closed.
    pub(crate) fn did_close(&mut self) {
        self.connection.invalidate();
        self.state = ProcessState::Terminated;
        self.reap();
    }

    /// Collect the exit status if the OS process is gone.
    pub(crate) fn reap(&mut self) -> Option<TerminationReason> {
        if self.exit_reason.is_none() {
            match self.os.try_wait() {
                Ok(reason) => self.exit_reason = reason,
                Err(e) => {
                    tracing::debug!(process_id = %self.id, error = %e, "Reap failed");
                    self.exit_reason = Some(TerminationReason::Unknown);
                }
            }
        }
        self.exit_reason
    }
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("domain", &self.registrable_domain)
            .field("pages", &self.pages.len())
            .finish()
    }
}
