//! Parent-side handle to one worker process.
//!
//! Spawning starts three tasks: a stdout reader that parses protocol lines,
//! a stderr forwarder, and a supervisor that owns the `Child`. Everything the
//! worker says (and its death) is broadcast as a [`WorkerEvent`], so a caller
//! subscribes first and dispatches second without missing an early reply.

use crate::config::WorkerCommandConfig;
use crate::error::{KernelError, Result};
use jsbox_common::{decode_line, encode_line, WorkerMessage, WorkerRequest};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{ChildStdin, Command};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{oneshot, Mutex};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something observed on a worker
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A protocol message read from the worker's stdout
    Message(WorkerMessage),
    /// The process is gone; `status` describes how it ended
    Exited { status: String },
}

#[derive(Debug)]
pub struct WorkerProcess {
    generation: u64,
    pid: Option<u32>,
    stdin: Mutex<Option<BufWriter<ChildStdin>>>,
    events: broadcast::Sender<WorkerEvent>,
    alive: Arc<AtomicBool>,
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl WorkerProcess {
    /// Spawn a worker and wait for its ready handshake.
    ///
    /// Fails with `ChildSpawnFailure` if the executable cannot be started, the
    /// process exits first, or `ready_timeout` elapses.
    pub async fn spawn(config: &WorkerCommandConfig, generation: u64) -> Result<Arc<Self>> {
        let program = config
            .resolve_program()
            .map_err(|e| KernelError::ChildSpawnFailure(e.to_string()))?;

        let mut child = Command::new(&program)
            .args(config.worker_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                KernelError::ChildSpawnFailure(format!("{}: {}", program.display(), e))
            })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| KernelError::ChildSpawnFailure("Failed to get worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KernelError::ChildSpawnFailure("Failed to get worker stdout".into()))?;
        let stderr = child.stderr.take();

        tracing::debug!(pid, generation, program = %program.display(), "Spawned worker");

        // Created before the reader starts so the handshake cannot be missed.
        let (events, mut ready_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let alive = Arc::new(AtomicBool::new(true));
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        // Protocol reader
        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match decode_line::<WorkerMessage>(&line) {
                        Some(message) => {
                            let _ = reader_events.send(WorkerEvent::Message(message));
                        }
                        None => {
                            tracing::warn!(pid, "Ignoring unrecognised worker output");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(pid, error = %e, "Worker stdout read failed");
                        break;
                    }
                }
            }
        });

        // Worker logs
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(pid, worker_stderr = %line);
                }
            });
        }

        // Supervisor: waits for exit or a kill request (dropping the sender
        // counts as one), then reports the exit after stdout is drained.
        let supervisor_events = events.clone();
        let supervisor_alive = alive.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(pid, error = %e, "Kill request failed");
                    }
                    child.wait().await
                }
            };
            let _ = reader.await;

            supervisor_alive.store(false, Ordering::SeqCst);
            let status = match status {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {}", e),
            };
            tracing::debug!(pid, %status, "Worker exited");
            let _ = supervisor_events.send(WorkerEvent::Exited { status });
        });

        let worker = Arc::new(Self {
            generation,
            pid,
            stdin: Mutex::new(Some(BufWriter::new(stdin))),
            events,
            alive,
            kill_tx: std::sync::Mutex::new(Some(kill_tx)),
        });

        match tokio::time::timeout(config.ready_timeout, wait_ready(&mut ready_rx)).await {
            Ok(Ok(())) => {
                tracing::info!(pid, generation, "Worker ready");
                Ok(worker)
            }
            Ok(Err(reason)) => {
                worker.kill();
                Err(KernelError::ChildSpawnFailure(reason))
            }
            Err(_) => {
                worker.kill();
                Err(KernelError::ChildSpawnFailure(format!(
                    "Worker did not become ready within {:?}",
                    config.ready_timeout
                )))
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Start listening for worker events. Only events sent after this call
    /// are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Write one request line to the worker
    pub async fn send(&self, request: &WorkerRequest) -> Result<()> {
        let line = encode_line(request)?;
        let mut stdin = self.stdin.lock().await;
        let writer = stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin is closed")
        })?;

        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            // A failed write leaves the pipe unusable.
            *stdin = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Request termination. Best-effort and idempotent; the exit is observed
    /// through [`WorkerEvent::Exited`].
    pub fn kill(&self) {
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sender) = sender {
            tracing::debug!(pid = self.pid, generation = self.generation, "Killing worker");
            let _ = sender.send(());
        }
    }
}

async fn wait_ready(
    events: &mut broadcast::Receiver<WorkerEvent>,
) -> std::result::Result<(), String> {
    loop {
        match events.recv().await {
            Ok(WorkerEvent::Message(WorkerMessage::Ready)) => return Ok(()),
            Ok(WorkerEvent::Message(_)) => continue,
            Ok(WorkerEvent::Exited { status }) => {
                return Err(format!("Worker exited before becoming ready ({})", status))
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return Err("Worker event channel closed".to_string()),
        }
    }
}
