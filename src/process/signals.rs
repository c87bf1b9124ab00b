//! Classification of worker termination.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Fatal fault (SIGSEGV, SIGBUS, SIGABRT, SIGILL).
    Crashed(Signal),
    /// SIGKILL; usually the OOM killer or a forced shutdown.
    Killed,
    /// Any other signal (SIGTERM from a requested shutdown lands here).
    Signaled(Signal),
    StillAlive,
    Unknown,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Whether the worker died from a fault rather than an exit or a request.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Crashed(_) | Self::Killed)
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Crashed(sig) => format!("crashed with {:?}", sig),
            Self::Killed => "killed (SIGKILL)".to_string(),
            Self::Signaled(sig) => format!("terminated by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::Killed,
            Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGABRT | Signal::SIGILL => {
                TerminationReason::Crashed(signal)
            }
            _ => TerminationReason::Signaled(signal),
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// A worker that went away without being asked to.
#[derive(Debug)]
pub struct WorkerFailure {
    pub reason: TerminationReason,
    /// What the worker was doing when it failed.
    pub context: Option<String>,
}

impl WorkerFailure {
    pub fn new(reason: TerminationReason) -> Self {
        Self {
            reason,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Worker {}", self.reason)?;
        if let Some(ctx) = &self.context {
            write!(f, " while {}", ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_analyze_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 0)),
            TerminationReason::Exited(0)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            TerminationReason::Crashed(Signal::SIGSEGV)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::Killed
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_fault_classification() {
        assert!(TerminationReason::Crashed(Signal::SIGBUS).is_fault());
        assert!(TerminationReason::Killed.is_fault());
        assert!(!TerminationReason::Exited(0).is_fault());
        assert!(!TerminationReason::Signaled(Signal::SIGTERM).is_fault());
        assert!(TerminationReason::Exited(0).is_success());
    }

    #[test]
    fn test_worker_failure_display() {
        let failure = WorkerFailure::new(TerminationReason::Killed).with_context("serving a.example");
        let display = failure.to_string();
        assert!(display.contains("SIGKILL"));
        assert!(display.contains("serving a.example"));
    }
}
