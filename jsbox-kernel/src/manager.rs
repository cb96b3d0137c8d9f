//! Parent-side execution manager.
//!
//! Owns at most one worker process and allows one run in flight at a time.
//! Runs never fail because of what the snippet did: exceptions, crashes and
//! kills all come back as `error` events in the returned output. The only
//! errors are `AlreadyPending` and `ChildSpawnFailure`.

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::process::{WorkerEvent, WorkerProcess};
use jsbox_common::{OutputEvent, RunId, WorkerMessage, WorkerRequest};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;

/// Worker status as seen from the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No worker; the next run spawns one
    Absent,
    /// A worker is starting and has not reported ready yet
    Spawning,
    /// Idle and ready to accept a run
    Ready,
    /// A run is in flight
    Executing,
    /// The worker exited and has not been replaced yet
    Dead,
}

pub struct ExecutionManager {
    config: KernelConfig,
    worker: Mutex<Option<Arc<WorkerProcess>>>,
    pending: std::sync::Mutex<Option<RunId>>,
    spawning: AtomicBool,
    generation: AtomicU64,
}

impl ExecutionManager {
    /// Create a manager. No worker is started until the first run (or an
    /// explicit [`warm_start`](Self::warm_start)).
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            worker: Mutex::new(None),
            pending: std::sync::Mutex::new(None),
            spawning: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Spawn the worker ahead of the first run
    pub async fn warm_start(&self) -> Result<()> {
        self.ensure_worker().await.map(|_| ())
    }

    /// Execute `code` in the worker and return the output it produced, in
    /// emission order.
    pub async fn run(&self, code: impl Into<String>) -> Result<Vec<OutputEvent>> {
        let run_id = RunId::new();
        let _guard = PendingGuard::acquire(&self.pending, run_id)?;
        let code = code.into();
        if code.is_empty() {
            // Workers never answer an empty run.
            return Ok(Vec::new());
        }
        let worker = self.ensure_worker().await?;

        tracing::debug!(%run_id, pid = worker.pid(), "Dispatching run");

        let output = match self.config.execution.run_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.dispatch(&worker, run_id, code)).await {
                    Ok(output) => output,
                    Err(_) => {
                        tracing::warn!(%run_id, ?limit, "Run timed out, resetting worker");
                        if let Err(e) = self.hard_reset().await {
                            tracing::warn!(error = %e, "Replacement worker failed to start");
                        }
                        vec![OutputEvent::error_message(format!(
                            "Execution timed out after {:?}",
                            limit
                        ))]
                    }
                }
            }
            None => self.dispatch(&worker, run_id, code).await,
        };

        tracing::debug!(%run_id, events = output.len(), "Run completed");
        Ok(output)
    }

    /// Kill the current worker (if any), clear the pending run, and start a
    /// fresh worker with a clean context.
    ///
    /// A run that was in flight resolves with a termination error.
    pub async fn hard_reset(&self) -> Result<()> {
        let mut slot = self.worker.lock().await;
        if let Some(old) = slot.take() {
            tracing::info!(pid = old.pid(), "Hard reset");
            old.kill();
        }
        self.clear_pending();

        let worker = self.spawn_worker().await?;
        *slot = Some(worker);
        Ok(())
    }

    /// Kill the current worker (if any) without replacing it
    pub async fn terminate(&self) {
        let mut slot = self.worker.lock().await;
        if let Some(old) = slot.take() {
            tracing::info!(pid = old.pid(), "Terminating worker");
            old.kill();
        }
        self.clear_pending();
    }

    /// Whether a run is currently outstanding
    pub fn is_pending(&self) -> bool {
        lock_pending(&self.pending).is_some()
    }

    pub async fn worker_state(&self) -> WorkerState {
        if self.spawning.load(Ordering::SeqCst) {
            return WorkerState::Spawning;
        }
        let slot = self.worker.lock().await;
        match slot.as_ref() {
            None => WorkerState::Absent,
            Some(worker) if !worker.is_alive() => WorkerState::Dead,
            Some(_) if self.is_pending() => WorkerState::Executing,
            Some(_) => WorkerState::Ready,
        }
    }

    pub async fn worker_pid(&self) -> Option<u32> {
        let slot = self.worker.lock().await;
        slot.as_ref().filter(|w| w.is_alive()).and_then(|w| w.pid())
    }

    async fn ensure_worker(&self) -> Result<Arc<WorkerProcess>> {
        let mut slot = self.worker.lock().await;
        if let Some(worker) = slot.as_ref() {
            if worker.is_alive() {
                return Ok(worker.clone());
            }
            tracing::info!(pid = worker.pid(), "Discarding exited worker");
            *slot = None;
        }

        let worker = self.spawn_worker().await?;
        *slot = Some(worker.clone());
        Ok(worker)
    }

    async fn spawn_worker(&self) -> Result<Arc<WorkerProcess>> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.spawning.store(true, Ordering::SeqCst);
        let result = WorkerProcess::spawn(&self.config.worker, generation).await;
        self.spawning.store(false, Ordering::SeqCst);

        if let Err(e) = &result {
            tracing::error!(generation, error = %e, "Worker failed to start");
        }
        result
    }

    /// Send one run and wait for its `done` or for the worker to die
    async fn dispatch(
        &self,
        worker: &Arc<WorkerProcess>,
        run_id: RunId,
        code: String,
    ) -> Vec<OutputEvent> {
        let mut events = worker.subscribe();
        if !worker.is_alive() {
            self.forget_worker(worker).await;
            return vec![terminated_before_completion(None)];
        }

        if let Err(e) = worker.send(&WorkerRequest::run(run_id, code)).await {
            tracing::warn!(%run_id, error = %e, "Failed to send run to worker");
            // The pipe is unusable; make the next run start a fresh worker.
            worker.kill();
            self.forget_worker(worker).await;
            return vec![OutputEvent::error_message(format!(
                "Failed to send code to worker: {}",
                e
            ))];
        }

        loop {
            match events.recv().await {
                Ok(WorkerEvent::Message(WorkerMessage::Done { run_id: id, output }))
                    if id == run_id =>
                {
                    return output;
                }
                Ok(WorkerEvent::Message(WorkerMessage::Done { run_id: id, .. })) => {
                    tracing::debug!(expected = %run_id, got = %id, "Ignoring stale reply");
                }
                Ok(WorkerEvent::Message(_)) => {}
                Ok(WorkerEvent::Exited { status }) => {
                    tracing::warn!(%run_id, pid = worker.pid(), %status, "Worker exited mid-run");
                    self.forget_worker(worker).await;
                    return vec![terminated_before_completion(Some(&status))];
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(%run_id, skipped, "Worker event receiver lagged");
                }
                Err(RecvError::Closed) => {
                    self.forget_worker(worker).await;
                    return vec![terminated_before_completion(None)];
                }
            }
        }
    }

    /// Drop `worker` from the slot unless it has already been replaced
    async fn forget_worker(&self, worker: &Arc<WorkerProcess>) {
        let mut slot = self.worker.lock().await;
        if slot
            .as_ref()
            .is_some_and(|current| current.generation() == worker.generation())
        {
            *slot = None;
        }
    }

    fn clear_pending(&self) {
        lock_pending(&self.pending).take();
    }
}

fn terminated_before_completion(status: Option<&str>) -> OutputEvent {
    match status {
        Some(status) => OutputEvent::error_message(format!(
            "Worker process terminated before execution completed ({})",
            status
        )),
        None => OutputEvent::error_message("Worker process terminated before execution completed"),
    }
}

fn lock_pending(
    pending: &std::sync::Mutex<Option<RunId>>,
) -> std::sync::MutexGuard<'_, Option<RunId>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks a run as pending for as long as it is alive. Releasing only clears
/// the slot if it still holds this run, so a reset in between is respected.
struct PendingGuard<'a> {
    pending: &'a std::sync::Mutex<Option<RunId>>,
    run_id: RunId,
}

impl<'a> PendingGuard<'a> {
    fn acquire(pending: &'a std::sync::Mutex<Option<RunId>>, run_id: RunId) -> Result<Self> {
        let mut slot = lock_pending(pending);
        if slot.is_some() {
            return Err(KernelError::AlreadyPending);
        }
        *slot = Some(run_id);
        Ok(Self { pending, run_id })
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock_pending(self.pending);
        if *slot == Some(self.run_id) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, WorkerCommandConfig};
    use assert_matches::assert_matches;
    use jsbox_common::OutputKind;
    use serde_json::json;
    use std::time::Duration;

    /// Answers every run with `["ok"]`. The codes `hang`, `crash` and
    /// `stale` never reply, exit, or send a foreign reply first.
    const FAKE_WORKER: &str = r#"echo '{"type":"ready"}'
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"runId":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"code":"hang"'*) continue ;;
    *'"code":"crash"'*) exit 3 ;;
    *'"code":"stale"'*) printf '{"type":"done","runId":"%s","output":[{"type":"log","output":["stale"]}]}\n' 00000000-0000-0000-0000-000000000000 ;;
  esac
  printf '{"type":"done","runId":"%s","output":[{"type":"log","output":["ok"]}]}\n' "$id"
done
"#;

    fn fake_config() -> KernelConfig {
        let mut worker = WorkerCommandConfig::default().with_program("/bin/sh");
        worker.args = vec!["-c".to_string(), FAKE_WORKER.to_string()];
        worker.ready_timeout = Duration::from_secs(5);
        KernelConfig {
            worker,
            execution: ExecutionConfig::default(),
        }
    }

    fn ok_output() -> Vec<OutputEvent> {
        vec![OutputEvent::new(OutputKind::Log, json!(["ok"]))]
    }

    async fn wait_until_pending(manager: &ExecutionManager) {
        for _ in 0..500 {
            if manager.is_pending() && manager.worker_state().await == WorkerState::Executing {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never became pending");
    }

    #[tokio::test]
    async fn test_lazy_spawn_and_reuse() {
        let manager = ExecutionManager::new(fake_config());
        assert_eq!(manager.worker_state().await, WorkerState::Absent);
        assert_eq!(manager.worker_pid().await, None);

        assert_eq!(manager.run("1").await.unwrap(), ok_output());
        let pid = manager.worker_pid().await;
        assert!(pid.is_some());
        assert_eq!(manager.worker_state().await, WorkerState::Ready);

        assert_eq!(manager.run("2").await.unwrap(), ok_output());
        assert_eq!(manager.worker_pid().await, pid);
        assert!(!manager.is_pending());
    }

    #[tokio::test]
    async fn test_already_pending() {
        let manager = Arc::new(ExecutionManager::new(fake_config()));
        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run("hang").await }
        });
        wait_until_pending(&manager).await;

        let err = manager.run("1").await.unwrap_err();
        assert_matches!(err, KernelError::AlreadyPending);
        assert_eq!(err.code(), "ALREADY_PENDING");

        manager.terminate().await;
        let output = first.await.unwrap().unwrap();
        assert_eq!(output.len(), 1);
        assert!(output[0].is_error());
    }

    #[tokio::test]
    async fn test_crash_mid_run_then_respawn() {
        let manager = ExecutionManager::new(fake_config());
        manager.warm_start().await.unwrap();
        let first_pid = manager.worker_pid().await;

        let output = manager.run("crash").await.unwrap();
        assert_eq!(output.len(), 1);
        assert!(output[0].is_error());
        assert!(output[0]
            .payload
            .as_str()
            .unwrap()
            .contains("terminated before execution completed"));
        assert!(!manager.is_pending());
        assert_eq!(manager.worker_state().await, WorkerState::Absent);

        assert_eq!(manager.run("1").await.unwrap(), ok_output());
        assert_ne!(manager.worker_pid().await, first_pid);
    }

    #[tokio::test]
    async fn test_external_kill_resolves_run() {
        let manager = Arc::new(ExecutionManager::new(fake_config()));
        let run = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run("hang").await }
        });
        wait_until_pending(&manager).await;

        let pid = manager.worker_pid().await.unwrap();
        let status = std::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let output = run.await.unwrap().unwrap();
        assert_eq!(output.len(), 1);
        assert!(output[0].is_error());
        assert!(!manager.is_pending());
    }

    #[tokio::test]
    async fn test_send_failure_resolves_and_drops_worker() {
        let mut config = fake_config();
        config.worker.args = vec![
            "-c".to_string(),
            r#"exec 0<&-; echo '{"type":"ready"}'; sleep 30"#.to_string(),
        ];
        let manager = ExecutionManager::new(config);
        manager.warm_start().await.unwrap();

        let output = manager.run("1").await.unwrap();
        assert_eq!(output.len(), 1);
        assert!(output[0].is_error());
        assert!(output[0]
            .payload
            .as_str()
            .unwrap()
            .contains("Failed to send code to worker"));
        assert!(!manager.is_pending());
        assert_eq!(manager.worker_state().await, WorkerState::Absent);
    }

    #[tokio::test]
    async fn test_empty_code_skips_worker() {
        let manager = ExecutionManager::new(fake_config());
        assert!(manager.run("").await.unwrap().is_empty());
        assert_eq!(manager.worker_state().await, WorkerState::Absent);
        assert!(!manager.is_pending());
    }

    #[tokio::test]
    async fn test_stale_reply_is_ignored() {
        let manager = ExecutionManager::new(fake_config());
        assert_eq!(manager.run("stale").await.unwrap(), ok_output());
    }

    #[tokio::test]
    async fn test_hard_reset_replaces_worker() {
        let manager = ExecutionManager::new(fake_config());
        manager.run("1").await.unwrap();
        let before = manager.worker_pid().await.unwrap();

        manager.hard_reset().await.unwrap();
        let after = manager.worker_pid().await.unwrap();
        assert_ne!(before, after);
        assert_eq!(manager.worker_state().await, WorkerState::Ready);
        assert_eq!(manager.run("2").await.unwrap(), ok_output());
    }

    #[tokio::test]
    async fn test_hard_reset_clears_pending_run() {
        let manager = Arc::new(ExecutionManager::new(fake_config()));
        let run = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run("hang").await }
        });
        wait_until_pending(&manager).await;

        manager.hard_reset().await.unwrap();
        assert!(!manager.is_pending());

        let output = run.await.unwrap().unwrap();
        assert_eq!(output.len(), 1);
        assert!(output[0].is_error());

        // The replacement survives the old run's exit handling.
        assert_eq!(manager.worker_state().await, WorkerState::Ready);
        assert_eq!(manager.run("1").await.unwrap(), ok_output());
    }

    #[tokio::test]
    async fn test_terminate_without_worker() {
        let manager = ExecutionManager::new(fake_config());
        manager.terminate().await;
        assert_eq!(manager.worker_state().await, WorkerState::Absent);
        assert!(!manager.is_pending());
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_guard() {
        let mut config = fake_config();
        config.worker = WorkerCommandConfig::default().with_program("/nonexistent/jsbox-worker");
        let manager = ExecutionManager::new(config);

        let err = manager.run("1").await.unwrap_err();
        assert_matches!(err, KernelError::ChildSpawnFailure(_));
        assert_eq!(err.code(), "CHILD_SPAWN_FAILURE");
        assert!(!manager.is_pending());
        assert_eq!(manager.worker_state().await, WorkerState::Absent);

        assert_matches!(manager.hard_reset().await, Err(KernelError::ChildSpawnFailure(_)));
    }

    #[tokio::test]
    async fn test_run_timeout_resets_worker() {
        let mut config = fake_config();
        config.execution = ExecutionConfig::with_timeout(Duration::from_millis(300));
        let manager = ExecutionManager::new(config);
        manager.warm_start().await.unwrap();
        let before = manager.worker_pid().await.unwrap();

        let output = manager.run("hang").await.unwrap();
        assert_eq!(output.len(), 1);
        assert!(output[0].payload.as_str().unwrap().contains("timed out"));
        assert!(!manager.is_pending());

        let after = manager.worker_pid().await.unwrap();
        assert_ne!(before, after);
        assert_eq!(manager.run("1").await.unwrap(), ok_output());
    }
}
