//! Sandbox runtime abstraction

pub mod v8;

pub use v8::{ModuleError, ModuleRoot, SandboxBindings, V8Sandbox};

/// A persistent, capability-limited execution context.
///
/// One context is created per worker and reused for every run on that
/// worker, so globals set by one snippet are visible to the next.
/// Implementations record output into the worker's capture buffer and turn
/// thrown errors into a single `error` event; `execute` never fails.
pub trait SandboxRuntime {
    /// Get runtime name
    fn name(&self) -> &str;

    /// Run source text to completion
    fn execute(&mut self, source: &str);
}
