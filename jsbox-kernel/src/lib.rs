//! jsbox kernel - process-isolated JavaScript execution
//!
//! The parent side ([`ExecutionManager`]) keeps one worker process alive and
//! serializes runs onto it. The worker side ([`worker`]) hosts a persistent
//! V8 context and captures console output per run.

pub mod capture;
pub mod config;
pub mod error;
pub mod manager;
pub mod process;
pub mod runtime;
pub mod worker;

pub use capture::{OutputCapture, SharedCapture, DEFAULT_CAPTURE_CAPACITY};
pub use config::{ExecutionConfig, KernelConfig, WorkerCommandConfig, WORKER_BINARY_NAME};
pub use error::{KernelError, Result};
pub use manager::{ExecutionManager, WorkerState};
pub use process::{WorkerEvent, WorkerProcess};
pub use runtime::{SandboxBindings, SandboxRuntime, V8Sandbox};
pub use worker::{Worker, WorkerOptions, WorkerPhase};

/// Re-export the protocol types
pub use jsbox_common::{OutputEvent, OutputKind, RunId};
