//! V8 JavaScript sandbox using deno_core

mod console;
mod modules;

use crate::capture::SharedCapture;
use deno_core::{JsRuntime, RuntimeOptions};
use jsbox_common::OutputKind;
use serde_json::Value;
use std::path::PathBuf;

pub use console::{create_sandbox_extension, SANDBOX_BOOTSTRAP_JS};
pub use modules::{LoadedModule, ModuleError, ModuleRoot};

/// Host capabilities handed to a new sandbox context
#[derive(Debug, Clone, Default)]
pub struct SandboxBindings {
    /// Directory `require` resolves against (None = `require` always throws)
    pub module_root: Option<PathBuf>,
}

/// V8 context reused across every run of one worker
pub struct V8Sandbox {
    runtime: JsRuntime,
    capture: SharedCapture,
}

impl V8Sandbox {
    /// Build the context and install the console and `require` bindings.
    ///
    /// A failing bootstrap is logged and the context is still returned; runs
    /// then see whatever globals the engine provides by default.
    pub fn create_context(capture: SharedCapture, bindings: SandboxBindings) -> Self {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![create_sandbox_extension()],
            ..Default::default()
        });

        {
            let op_state = runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            op_state.put(capture.clone());
            op_state.put(ModuleRoot::new(bindings.module_root));
        }

        if let Err(e) = runtime.execute_script("<jsbox-bootstrap>", SANDBOX_BOOTSTRAP_JS) {
            tracing::error!(error = %e, "Failed to install sandbox bindings");
        }

        Self { runtime, capture }
    }
}

impl super::SandboxRuntime for V8Sandbox {
    fn name(&self) -> &str {
        "v8"
    }

    fn execute(&mut self, source: &str) {
        if let Err(e) = self.runtime.execute_script("<sandbox>", source.to_string()) {
            // Display carries the message and the stack frames.
            self.capture
                .borrow_mut()
                .insert_output(OutputKind::Error, Value::String(e.to_string()));
        }
    }
}
