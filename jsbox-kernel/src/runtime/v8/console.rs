//! Console and `require` bindings installed into the sandbox context.

use super::modules::{LoadedModule, ModuleRoot};
use crate::capture::{OutputCapture, SharedCapture};
use deno_core::{op2, Extension, OpState};
use deno_error::JsErrorBox;
use serde_json::Value;

/// Console call forwarded from the sandbox
#[op2]
fn op_jsbox_console(
    state: &mut OpState,
    #[string] channel: String,
    #[serde] args: Vec<Value>,
) {
    let capture = state.borrow::<SharedCapture>().clone();
    dispatch_console(&mut capture.borrow_mut(), &channel, args);
}

/// Module source lookup for `require`
#[op2]
#[serde]
fn op_jsbox_load_module(
    state: &mut OpState,
    #[string] specifier: String,
) -> Result<LoadedModule, JsErrorBox> {
    state
        .borrow::<ModuleRoot>()
        .load(&specifier)
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Create the sandbox extension
pub fn create_sandbox_extension() -> Extension {
    let ops = vec![op_jsbox_console(), op_jsbox_load_module()];

    Extension {
        name: "jsbox_sandbox",
        ops: std::borrow::Cow::Owned(ops),
        ..Default::default()
    }
}

/// Route one console call to the matching capture adapter.
pub(crate) fn dispatch_console(capture: &mut OutputCapture, channel: &str, args: Vec<Value>) {
    match channel {
        "log" => capture.log(args),
        "error" => capture.error(args),
        "warn" => capture.warn(args),
        "info" => capture.info(args),
        "table" => capture.table(args),
        "count" => capture.count(args),
        "dir" => capture.dir(args),
        "debug" => capture.debug(args),
        "assert" => {
            let mut args = args.into_iter();
            let condition = matches!(args.next(), Some(Value::Bool(true)));
            capture.assert(condition, args.collect());
        }
        "group" => capture.group(args.into_iter().next().unwrap_or(Value::Null)),
        "groupEnd" => capture.group_end(),
        "trace" => {
            let stack = args.first().and_then(Value::as_str).unwrap_or_default();
            capture.trace(stack);
        }
        "clear" => capture.clear(),
        other => tracing::debug!(channel = other, "Ignoring unknown console channel"),
    }
}

/// Installs `console` and `require`, then hides the engine's own globals.
/// Arguments are converted to JSON-safe values before crossing into Rust.
pub const SANDBOX_BOOTSTRAP_JS: &str = r#"
((globalThis) => {
    const { op_jsbox_console: emit, op_jsbox_load_module: loadModule } = Deno.core.ops;

    const toWire = (value, ancestors) => {
        switch (typeof value) {
            case "undefined":
                return null;
            case "function":
                return `[Function: ${value.name || "anonymous"}]`;
            case "symbol":
                return value.toString();
            case "bigint":
                return `${value}n`;
            case "number":
                return Number.isFinite(value) ? value : String(value);
            case "string":
            case "boolean":
                return value;
        }
        if (value === null) return null;
        if (value instanceof Error) return value.stack ?? String(value);
        if (value instanceof Date) {
            return Number.isNaN(value.getTime()) ? "Invalid Date" : value.toISOString();
        }
        if (ancestors.has(value)) return "[Circular]";
        ancestors.add(value);
        try {
            if (Array.isArray(value)) return value.map((item) => toWire(item, ancestors));
            if (value instanceof Map) {
                return Array.from(value, ([k, v]) => [toWire(k, ancestors), toWire(v, ancestors)]);
            }
            if (value instanceof Set) return Array.from(value, (item) => toWire(item, ancestors));
            const out = {};
            for (const key of Object.keys(value)) {
                out[key] = toWire(value[key], ancestors);
            }
            return out;
        } finally {
            ancestors.delete(value);
        }
    };

    const send = (channel, args) => {
        const wire = args.map((arg) => {
            try {
                return toWire(arg, new WeakSet());
            } catch {
                return "[Unserializable]";
            }
        });
        emit(channel, wire);
    };

    function trace() {
        const holder = new Error();
        Error.captureStackTrace(holder, trace);
        send("trace", [holder.stack ?? ""]);
    }

    const console = {
        log: (...args) => send("log", args),
        error: (...args) => send("error", args),
        warn: (...args) => send("warn", args),
        info: (...args) => send("info", args),
        table: (...args) => send("table", args),
        assert: (condition, ...args) => send("assert", [Boolean(condition), ...args]),
        count: (...args) => send("count", args),
        group: (label) => send("group", [label]),
        groupEnd: () => send("groupEnd", []),
        trace,
        dir: (...args) => send("dir", args),
        debug: (...args) => send("debug", args),
        clear: () => send("clear", []),
    };

    const moduleCache = new Map();

    function require(specifier) {
        if (typeof specifier !== "string") {
            throw new TypeError("require() expects a string specifier");
        }
        const { filename, source } = loadModule(specifier);
        const cached = moduleCache.get(filename);
        if (cached) return cached.exports;

        const module = { exports: {}, filename };
        moduleCache.set(filename, module);
        try {
            const body = new Function(
                "module",
                "exports",
                "require",
                "__filename",
                `${source}\n//# sourceURL=${filename}`,
            );
            body.call(module.exports, module, module.exports, require, filename);
        } catch (err) {
            moduleCache.delete(filename);
            throw err;
        }
        return module.exports;
    }

    const define = (name, value) =>
        Object.defineProperty(globalThis, name, {
            value,
            writable: true,
            configurable: true,
            enumerable: false,
        });
    define("console", console);
    define("require", require);

    // Engine internals: `Deno.core` and its aliases reach raw ops such as print.
    for (const name of ["Deno", "__bootstrap", "__infra"]) {
        try {
            if (!delete globalThis[name]) globalThis[name] = undefined;
        } catch {
            // pinned by the engine
        }
    }
})(globalThis);
"#;
