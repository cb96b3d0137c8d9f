//! Messages exchanged between the execution manager and a worker process.
//!
//! Transport is newline-delimited JSON over the worker's stdin (requests) and
//! stdout (replies). Lines that do not parse into a known shape are dropped by
//! both sides.

use crate::output::OutputEvent;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Correlation token pairing one run request with its single reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub uuid::Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Manager -> worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerRequest {
    Run(RunRequest),
}

/// Body of a `run` request.
///
/// Both fields are optional on the wire so a worker can recognise and skip a
/// malformed request instead of failing to parse the whole line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(rename = "runId", default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl WorkerRequest {
    pub fn run(run_id: RunId, code: impl Into<String>) -> Self {
        WorkerRequest::Run(RunRequest {
            run_id: Some(run_id),
            code: Some(code.into()),
        })
    }
}

impl RunRequest {
    /// Returns the id and code when the request can be executed.
    /// Missing id or missing/empty code means the request is ignored.
    pub fn accepted(self) -> Option<(RunId, String)> {
        match (self.run_id, self.code) {
            (Some(run_id), Some(code)) if !code.is_empty() => Some((run_id, code)),
            _ => None,
        }
    }
}

/// Worker -> manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// Emitted once after the sandbox context is built
    Ready,
    /// Exactly one per accepted run request
    Done {
        #[serde(rename = "runId")]
        run_id: RunId,
        output: Vec<OutputEvent>,
    },
}

/// Serialize a message as one protocol line (trailing newline included).
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one protocol line. Blank and unrecognised lines yield `None`.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Option<T> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}
