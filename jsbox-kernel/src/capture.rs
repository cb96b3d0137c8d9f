//! Bounded, ordered buffer of console output for one worker.
//!
//! Events are only recorded inside a capture session (`start_capture` ..
//! `end_capture`). When the buffer is full the oldest event is evicted, so a
//! chatty snippet returns its most recent output.

use jsbox_common::{OutputEvent, OutputKind};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Default number of events kept per capture session
pub const DEFAULT_CAPTURE_CAPACITY: usize = 999;

/// Capture buffer shared between a worker and the sandbox context it drives.
/// Single-threaded: the context and its worker live on the same thread.
pub type SharedCapture = Rc<RefCell<OutputCapture>>;

#[derive(Debug)]
pub struct OutputCapture {
    capturing: bool,
    capacity: usize,
    buffer: VecDeque<OutputEvent>,
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPTURE_CAPACITY)
    }

    /// A capacity of zero is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capturing: false,
            capacity,
            buffer: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn shared(capacity: usize) -> SharedCapture {
        Rc::new(RefCell::new(Self::with_capacity(capacity)))
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Begin a session. Events left over from an unfinished session are dropped.
    pub fn start_capture(&mut self) {
        self.buffer.clear();
        self.capturing = true;
    }

    /// End the session and hand back everything recorded in it.
    pub fn end_capture(&mut self) -> Vec<OutputEvent> {
        self.capturing = false;
        self.buffer.drain(..).collect()
    }

    pub fn insert_output(&mut self, kind: OutputKind, payload: Value) {
        if !self.capturing {
            return;
        }
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(OutputEvent::new(kind, payload));
    }

    pub fn log(&mut self, args: Vec<Value>) {
        self.insert_output(OutputKind::Log, Value::Array(args));
    }

    pub fn error(&mut self, args: Vec<Value>) {
        self.insert_output(OutputKind::Error, Value::Array(args));
    }

    pub fn warn(&mut self, args: Vec<Value>) {
        self.insert_output(OutputKind::Warn, Value::Array(args));
    }

    pub fn info(&mut self, args: Vec<Value>) {
        self.insert_output(OutputKind::Info, Value::Array(args));
    }

    pub fn table(&mut self, args: Vec<Value>) {
        self.insert_output(OutputKind::Table, Value::Array(args));
    }

    /// Records only failed assertions.
    pub fn assert(&mut self, condition: bool, args: Vec<Value>) {
        if condition {
            return;
        }
        self.insert_output(OutputKind::Assert, Value::Array(args));
    }

    pub fn count(&mut self, args: Vec<Value>) {
        self.insert_output(OutputKind::Count, Value::Array(args));
    }

    pub fn group(&mut self, label: Value) {
        self.insert_output(OutputKind::Group, label);
    }

    pub fn group_end(&mut self) {
        self.insert_output(OutputKind::GroupEnd, json!({}));
    }

    /// `stack` is a synthesized call stack whose first line is the error
    /// header; the remaining frames are re-indented by two spaces.
    pub fn trace(&mut self, stack: &str) {
        if !self.capturing {
            return;
        }
        let formatted = stack
            .lines()
            .skip(1)
            .map(|line| format!("  {}", line.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        self.insert_output(OutputKind::Trace, Value::String(formatted));
    }

    pub fn dir(&mut self, args: Vec<Value>) {
        self.insert_output(OutputKind::Dir, Value::Array(args));
    }

    pub fn debug(&mut self, args: Vec<Value>) {
        self.insert_output(OutputKind::Debug, Value::Array(args));
    }

    /// console.clear: drop what the current session has recorded so far
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
