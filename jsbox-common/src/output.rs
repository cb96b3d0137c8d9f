//! Console-style output events recorded while a snippet runs

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Console channel an event was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputKind {
    Log,
    Error,
    Warn,
    Info,
    Table,
    Assert,
    Count,
    Group,
    GroupEnd,
    Trace,
    Dir,
    Debug,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Log => "log",
            OutputKind::Error => "error",
            OutputKind::Warn => "warn",
            OutputKind::Info => "info",
            OutputKind::Table => "table",
            OutputKind::Assert => "assert",
            OutputKind::Count => "count",
            OutputKind::Group => "group",
            OutputKind::GroupEnd => "groupEnd",
            OutputKind::Trace => "trace",
            OutputKind::Dir => "dir",
            OutputKind::Debug => "debug",
        }
    }
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutputKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "log" => OutputKind::Log,
            "error" => OutputKind::Error,
            "warn" => OutputKind::Warn,
            "info" => OutputKind::Info,
            "table" => OutputKind::Table,
            "assert" => OutputKind::Assert,
            "count" => OutputKind::Count,
            "group" => OutputKind::Group,
            "groupEnd" => OutputKind::GroupEnd,
            "trace" => OutputKind::Trace,
            "dir" => OutputKind::Dir,
            "debug" => OutputKind::Debug,
            other => return Err(format!("unknown output kind '{}'", other)),
        };
        Ok(kind)
    }
}

/// One structured record of a console-style call.
///
/// On the wire this is `{"type": <kind>, "output": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[serde(rename = "output")]
    pub payload: Value,
}

impl OutputEvent {
    pub fn new(kind: OutputKind, payload: impl Into<Value>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Single `error` event carrying a plain message, used for failures that
    /// happen outside the executed code.
    pub fn error_message(message: impl Into<String>) -> Self {
        Self::new(OutputKind::Error, Value::String(message.into()))
    }

    pub fn is_error(&self) -> bool {
        self.kind == OutputKind::Error
    }
}
