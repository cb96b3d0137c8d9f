//! Worker side of the execution protocol.
//!
//! A worker owns one sandbox context and one capture buffer. It announces
//! itself with a `ready` line, then answers every accepted `run` request with
//! exactly one `done` line until its input closes or it is killed.

use crate::capture::{OutputCapture, SharedCapture};
use crate::runtime::{SandboxBindings, SandboxRuntime, V8Sandbox};
use jsbox_common::{decode_line, encode_line, OutputEvent, RunId, WorkerMessage, WorkerRequest};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Lifecycle of the worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Starting,
    Ready,
    Executing,
    Terminated,
}

pub struct Worker<R: SandboxRuntime> {
    runtime: R,
    capture: SharedCapture,
    phase: WorkerPhase,
    runs: u64,
}

impl<R: SandboxRuntime> Worker<R> {
    /// `capture` must be the buffer `runtime` records into.
    pub fn new(runtime: R, capture: SharedCapture) -> Self {
        Self {
            runtime,
            capture,
            phase: WorkerPhase::Starting,
            runs: 0,
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Move to `Ready` and produce the handshake message
    pub fn mark_ready(&mut self) -> WorkerMessage {
        self.phase = WorkerPhase::Ready;
        WorkerMessage::Ready
    }

    pub fn terminate(&mut self) {
        self.phase = WorkerPhase::Terminated;
    }

    /// Handle one inbound protocol line. Malformed requests yield no reply.
    pub fn handle_line(&mut self, line: &str) -> Option<WorkerMessage> {
        if self.phase != WorkerPhase::Ready {
            return None;
        }
        let WorkerRequest::Run(request) = decode_line::<WorkerRequest>(line)?;
        let Some((run_id, code)) = request.accepted() else {
            tracing::debug!("Ignoring malformed run request");
            return None;
        };
        Some(self.execute(run_id, &code))
    }

    /// Run one snippet inside a fresh capture session
    pub fn execute(&mut self, run_id: RunId, code: &str) -> WorkerMessage {
        self.phase = WorkerPhase::Executing;
        self.runs += 1;
        tracing::debug!(run_id = %run_id, code_len = code.len(), "Executing run");

        self.capture.borrow_mut().start_capture();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.runtime.execute(code)));
        let mut output = self.capture.borrow_mut().end_capture();

        if outcome.is_err() {
            tracing::error!(run_id = %run_id, "Sandbox panicked while executing run");
            output.push(OutputEvent::error_message(
                "Internal failure while executing code",
            ));
        }

        self.phase = WorkerPhase::Ready;
        WorkerMessage::Done { run_id, output }
    }
}

/// Drive a worker over a line-oriented transport until the input closes.
pub async fn serve<R, I, O>(worker: &mut Worker<R>, mut input: I, mut output: O) -> anyhow::Result<()>
where
    R: SandboxRuntime,
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let ready = worker.mark_ready();
    write_message(&mut output, &ready).await?;

    let mut buf = Vec::new();
    loop {
        buf.clear();
        let bytes_read = input.read_until(b'\n', &mut buf).await?;
        if bytes_read == 0 {
            break; // EOF
        }

        let line = String::from_utf8_lossy(&buf);
        if let Some(reply) = worker.handle_line(&line) {
            write_message(&mut output, &reply).await?;
        }
    }

    worker.terminate();
    tracing::debug!(runs = worker.runs(), "Worker input closed");
    Ok(())
}

async fn write_message<O: AsyncWrite + Unpin>(
    output: &mut O,
    message: &WorkerMessage,
) -> anyhow::Result<()> {
    let line = encode_line(message)?;
    output.write_all(line.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

/// Settings of the worker binary
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub capture_capacity: usize,
    pub module_root: Option<PathBuf>,
}

/// Move the protocol stream off `target`: returns a private duplicate of it
/// and points `target` at `replacement`. Later writes to `target` (engine
/// prints, stray `println!`) land on `replacement` instead of the protocol.
#[cfg(unix)]
pub fn claim_descriptor(
    target: std::os::fd::RawFd,
    replacement: std::os::fd::RawFd,
) -> std::io::Result<std::fs::File> {
    use std::os::fd::FromRawFd;

    // SAFETY: only duplicates descriptors this process already owns; the
    // duplicate is handed to exactly one `File`.
    unsafe {
        let private = libc::fcntl(target, libc::F_DUPFD_CLOEXEC, 0);
        if private < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::dup2(replacement, target) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(private);
            return Err(err);
        }
        Ok(std::fs::File::from_raw_fd(private))
    }
}

/// Build the V8 sandbox and serve the protocol on stdin/stdout.
///
/// On unix the protocol keeps a private copy of stdout and fd 1 is pointed
/// at stderr before the engine starts.
pub async fn run_stdio(options: WorkerOptions) -> anyhow::Result<()> {
    #[cfg(unix)]
    let stdout = tokio::fs::File::from_std(claim_descriptor(
        libc::STDOUT_FILENO,
        libc::STDERR_FILENO,
    )?);
    #[cfg(not(unix))]
    let stdout = tokio::io::stdout();

    let capture = OutputCapture::shared(options.capture_capacity);
    let runtime = V8Sandbox::create_context(
        capture.clone(),
        SandboxBindings {
            module_root: options.module_root,
        },
    );
    let mut worker = Worker::new(runtime, capture);

    tracing::info!(
        pid = std::process::id(),
        runtime = worker.runtime.name(),
        "Worker started"
    );

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve(&mut worker, stdin, stdout).await
}
