//! Worker spawn interface.
//!
//! A [`WorkerLauncher`] turns launch parameters into a running worker plus the
//! transport to reach it. [`ProcessLauncher`] re-executes the current binary
//! in worker mode; [`InProcessLauncher`] hosts the worker logic in-process.

use super::proc::{OsProcess, Proc};
use super::signals::TerminationReason;
use super::worker_main::WorkerState;
use crate::error::{PoolError, Result};
use crate::ipc::pipe::PipeFd;
use crate::ipc::transport::{LoopbackHandle, LoopbackTransport, PipeTransport, Transport};
use crate::types::{ProcessId, ProcessRole};
use nix::sys::signal::Signal;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::rc::Rc;

/// What the OS launcher needs to start a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchParameters {
    pub process_id: ProcessId,
    pub role: ProcessRole,
    pub sandbox_profile: Option<String>,
    pub additional_read_access_paths: Vec<PathBuf>,
    pub additional_read_write_paths: Vec<PathBuf>,
}

/// A worker that has been started but has not necessarily finished launching.
pub struct LaunchedWorker {
    pub pid: u32,
    pub transport: Box<dyn Transport>,
    pub os: Box<dyn OsProcess>,
}

pub trait WorkerLauncher {
    fn launch(&self, parameters: &LaunchParameters) -> Result<LaunchedWorker>;
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

/// Launches workers as child processes of a `sitepool` binary.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: Option<PathBuf>,
}

impl ProcessLauncher {
    /// Re-execute the current executable.
    pub fn new() -> Self {
        Self { program: None }
    }

    /// Use an explicit `sitepool` binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe()
                .map_err(|e| PoolError::Launch(format!("Failed to get current executable: {}", e))),
        }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, parameters: &LaunchParameters) -> Result<LaunchedWorker> {
        let mut cmd = Command::new(self.program()?);
        cmd.arg("worker").arg("--role").arg(parameters.role.as_str());

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        // Worker logs go to the orchestrator's stderr.
        cmd.stderr(Stdio::inherit());

        cmd.env("SITEPOOL_PROCESS_ID", parameters.process_id.0.to_string());
        if let Some(profile) = &parameters.sandbox_profile {
            cmd.env("SITEPOOL_SANDBOX_PROFILE", profile);
        }
        if !parameters.additional_read_access_paths.is_empty() {
            cmd.env(
                "SITEPOOL_READ_PATHS",
                join_paths(&parameters.additional_read_access_paths),
            );
        }
        if !parameters.additional_read_write_paths.is_empty() {
            cmd.env(
                "SITEPOOL_READ_WRITE_PATHS",
                join_paths(&parameters.additional_read_write_paths),
            );
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| PoolError::Launch(format!("Failed to spawn worker: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Launch("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Launch("Child stdout not captured".into()))?;

        let os = Proc::from_child(&child);
        let transport = PipeTransport::new(PipeFd::new(stdin), PipeFd::new(stdout))?;

        tracing::debug!(pid = child.id(), role = %parameters.role, "Spawned worker");
        Ok(LaunchedWorker {
            pid: child.id(),
            transport: Box::new(transport),
            os: Box::new(os),
        })
    }
}

/// Exit bookkeeping shared between a fake OS process and its launcher.
struct InProcessWorker {
    role: ProcessRole,
    handle: LoopbackHandle,
    state: Rc<RefCell<WorkerState>>,
    exit: Rc<Cell<Option<TerminationReason>>>,
}

#[derive(Default)]
struct InProcessRegistry {
    next_pid: u32,
    workers: BTreeMap<u32, InProcessWorker>,
    failures_to_inject: usize,
    launches: usize,
}

/// Runs worker logic in-process over loopback transports.
///
/// Clones share the same registry, so a test can keep one clone to crash or
/// hang workers that the pool launched through another.
#[derive(Clone, Default)]
pub struct InProcessLauncher {
    registry: Rc<RefCell<InProcessRegistry>>,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` launches fail.
    pub fn fail_next_launches(&self, count: usize) {
        self.registry.borrow_mut().failures_to_inject = count;
    }

    /// Number of successful launches.
    pub fn launch_count(&self) -> usize {
        self.registry.borrow().launches
    }

    /// Kill a worker as if it faulted. Returns false for unknown pids.
    pub fn crash(&self, pid: u32) -> bool {
        let registry = self.registry.borrow();
        match registry.workers.get(&pid) {
            Some(worker) => {
                if worker.exit.get().is_none() {
                    worker.exit.set(Some(TerminationReason::Crashed(Signal::SIGSEGV)));
                }
                worker.handle.crash();
                true
            }
            None => false,
        }
    }

    /// Make a worker stop answering.
    pub fn hang(&self, pid: u32) -> bool {
        match self.registry.borrow().workers.get(&pid) {
            Some(worker) => {
                worker.handle.hang();
                true
            }
            None => false,
        }
    }

    pub fn handle(&self, pid: u32) -> Option<LoopbackHandle> {
        self.registry
            .borrow()
            .workers
            .get(&pid)
            .map(|w| w.handle.clone())
    }

    /// Pids of workers of `role` that are still running.
    pub fn running_pids(&self, role: ProcessRole) -> Vec<u32> {
        self.registry
            .borrow()
            .workers
            .iter()
            .filter(|(_, w)| w.role == role && !w.handle.is_closed())
            .map(|(pid, _)| *pid)
            .collect()
    }

    /// Names of the messages a worker has received.
    pub fn received_names(&self, pid: u32) -> Vec<String> {
        self.handle(pid)
            .map(|h| h.received_names())
            .unwrap_or_default()
    }

    pub fn page_count(&self, pid: u32) -> usize {
        self.registry
            .borrow()
            .workers
            .get(&pid)
            .map(|w| w.state.borrow().page_count())
            .unwrap_or(0)
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, parameters: &LaunchParameters) -> Result<LaunchedWorker> {
        let mut registry = self.registry.borrow_mut();
        if registry.failures_to_inject > 0 {
            registry.failures_to_inject -= 1;
            return Err(PoolError::Launch("injected launch failure".into()));
        }

        registry.next_pid += 1;
        let pid = 10_000 + registry.next_pid;
        let state = Rc::new(RefCell::new(WorkerState::new(pid, parameters.role)));

        let peer_state = state.clone();
        let (transport, handle) =
            LoopbackTransport::new(move |frame| peer_state.borrow_mut().handle(frame));
        for frame in state.borrow().launch_frames()? {
            handle.inject(&frame)?;
        }

        let exit = Rc::new(Cell::new(None));
        registry.workers.insert(
            pid,
            InProcessWorker {
                role: parameters.role,
                handle: handle.clone(),
                state,
                exit: exit.clone(),
            },
        );
        registry.launches += 1;

        Ok(LaunchedWorker {
            pid,
            transport: Box::new(transport),
            os: Box::new(InProcessOs { pid, handle, exit }),
        })
    }
}

/// OS-process stand-in for an in-process worker.
struct InProcessOs {
    pid: u32,
    handle: LoopbackHandle,
    exit: Rc<Cell<Option<TerminationReason>>>,
}

impl OsProcess for InProcessOs {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn terminate(&mut self) -> Result<()> {
        if self.exit.get().is_none() && !self.handle.is_closed() {
            self.exit.set(Some(TerminationReason::Signaled(Signal::SIGTERM)));
        }
        self.handle.crash();
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        if self.exit.get().is_none() && !self.handle.is_closed() {
            self.exit.set(Some(TerminationReason::Killed));
        }
        self.handle.crash();
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = self.exit.get() {
            return Ok(Some(reason));
        }
        if self.handle.is_closed() {
            // Left its loop after `Exit`.
            self.exit.set(Some(TerminationReason::Exited(0)));
            return Ok(self.exit.get());
        }
        Ok(None)
    }
}
