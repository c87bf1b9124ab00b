//! Worker processes: spawning, OS handles, the orchestrator-side record and
//! the worker-side entry point.

pub mod arena;
pub mod launcher;
pub mod proc;
pub mod signals;
pub mod worker;
pub mod worker_main;

pub use arena::ProcessArena;
pub use launcher::{InProcessLauncher, LaunchParameters, LaunchedWorker, ProcessLauncher, WorkerLauncher};
pub use proc::OsProcess;
pub use signals::{TerminationReason, WorkerFailure};
pub use worker::{ProcessState, WorkerProcess};
pub use worker_main::run_worker_main;
