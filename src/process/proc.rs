//! Handle to a worker's OS process.

use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{PoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// OS-level lifecycle of a worker, independent of its message channel.
pub trait OsProcess {
    fn pid(&self) -> u32;

    /// Ask the process to exit.
    fn terminate(&mut self) -> Result<()>;

    /// Force the process down and reap it.
    fn kill(&mut self) -> Result<()>;

    /// Non-blocking wait. `None` while the process is running.
    fn try_wait(&mut self) -> Result<Option<TerminationReason>>;

    fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Wait up to `timeout` for an exit, then SIGTERM, then SIGKILL.
    fn stop(&mut self, timeout: Duration) -> Result<TerminationReason> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(reason) = self.try_wait()? {
                return Ok(reason);
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        self.terminate()?;
        std::thread::sleep(Duration::from_millis(100));
        if let Some(reason) = self.try_wait()? {
            return Ok(reason);
        }

        self.kill()?;
        Ok(self.try_wait()?.unwrap_or(TerminationReason::Killed))
    }
}

/// A spawned child process.
pub struct Proc {
    pid: Pid,
    exit: Option<TerminationReason>,
}

impl Proc {
    /// Take over a spawned `std::process::Child`.
    ///
    /// The child's pipes must already have been taken by the transport.
    pub fn from_child(child: &std::process::Child) -> Self {
        Self {
            pid: Pid::from_raw(child.id() as i32),
            exit: None,
        }
    }

    fn reap(&mut self, flags: Option<WaitPidFlag>) -> Result<Option<TerminationReason>> {
        if let Some(reason) = self.exit {
            return Ok(Some(reason));
        }
        match waitpid(self.pid, flags) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                let reason = analyze_wait_status(status);
                self.exit = Some(reason);
                Ok(Some(reason))
            }
            Err(nix::errno::Errno::ECHILD) => {
                self.exit = Some(TerminationReason::Unknown);
                Ok(self.exit)
            }
            Err(e) => Err(PoolError::Worker(format!("waitpid failed: {}", e))),
        }
    }
}

impl OsProcess for Proc {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn terminate(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| PoolError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    fn kill(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| PoolError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        self.reap(None)?;
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        self.reap(Some(WaitPidFlag::WNOHANG))
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(10));
            if let Ok(Some(_)) = self.try_wait() {
                return;
            }
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.exit = Some(TerminationReason::Killed);
        }
    }
}
