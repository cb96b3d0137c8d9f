//! End-to-end tests against the real `jsbox-worker` binary.

use assert_matches::assert_matches;
use jsbox_kernel::{
    ExecutionConfig, ExecutionManager, KernelConfig, KernelError, OutputEvent, OutputKind,
    WorkerCommandConfig, WorkerState,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn config() -> KernelConfig {
    let mut worker = WorkerCommandConfig::default().with_program(env!("CARGO_BIN_EXE_jsbox-worker"));
    worker.ready_timeout = Duration::from_secs(30);
    KernelConfig {
        worker,
        execution: ExecutionConfig::default(),
    }
}

async fn wait_until_executing(manager: &ExecutionManager) {
    for _ in 0..1000 {
        if manager.worker_state().await == WorkerState::Executing {
            // Give the request time to reach the worker.
            tokio::time::sleep(Duration::from_millis(200)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run never started");
}

#[tokio::test]
async fn test_output_order() {
    let manager = ExecutionManager::new(config());
    let output = manager
        .run("console.log('a'); console.error('b')")
        .await
        .unwrap();
    assert_eq!(
        output,
        vec![
            OutputEvent::new(OutputKind::Log, json!(["a"])),
            OutputEvent::new(OutputKind::Error, json!(["b"])),
        ]
    );
}

#[tokio::test]
async fn test_thrown_error_is_output() {
    let manager = ExecutionManager::new(config());
    let output = manager.run("throw Error('boom')").await.unwrap();
    assert_eq!(output.len(), 1);
    assert!(output[0].is_error());
    assert!(output[0].payload.as_str().unwrap().contains("boom"));

    // The worker survives and keeps serving.
    let output = manager.run("console.log(1 + 1)").await.unwrap();
    assert_eq!(output, vec![OutputEvent::new(OutputKind::Log, json!([2]))]);
}

#[tokio::test]
async fn test_empty_code_yields_no_output() {
    let manager = ExecutionManager::new(config());
    assert!(manager.run("").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_state_persists_until_hard_reset() {
    let manager = ExecutionManager::new(config());
    assert!(manager.run("globalThis.x = 5").await.unwrap().is_empty());
    assert_eq!(
        manager.run("console.log(x)").await.unwrap(),
        vec![OutputEvent::new(OutputKind::Log, json!([5]))]
    );

    manager.hard_reset().await.unwrap();
    let output = manager.run("console.log(typeof x)").await.unwrap();
    assert_eq!(output, vec![OutputEvent::new(OutputKind::Log, json!(["undefined"]))]);
}

#[tokio::test]
async fn test_capture_is_bounded() {
    let manager = ExecutionManager::new(config());
    let output = manager
        .run("for (let i = 0; i <= 1000; i++) console.log(i)")
        .await
        .unwrap();
    assert_eq!(output.len(), 999);
    assert_eq!(output[0].payload, json!([2]));
    assert_eq!(output[998].payload, json!([1000]));
}

#[tokio::test]
async fn test_second_run_while_pending_is_rejected() {
    let manager = Arc::new(ExecutionManager::new(config()));
    let spinning = tokio::spawn({
        let manager = manager.clone();
        async move { manager.run("while (true) {}").await }
    });
    wait_until_executing(&manager).await;

    assert_matches!(
        manager.run("console.log(1)").await,
        Err(KernelError::AlreadyPending)
    );

    manager.terminate().await;
    let output = spinning.await.unwrap().unwrap();
    assert_eq!(output.len(), 1);
    assert!(output[0].is_error());
    assert!(!manager.is_pending());
}

#[tokio::test]
async fn test_run_after_terminate_spawns_fresh_worker() {
    let manager = ExecutionManager::new(config());
    manager.run("globalThis.seen = true").await.unwrap();
    manager.terminate().await;
    assert_eq!(manager.worker_state().await, WorkerState::Absent);

    let output = manager.run("console.log(typeof seen)").await.unwrap();
    assert_eq!(output, vec![OutputEvent::new(OutputKind::Log, json!(["undefined"]))]);
}

#[tokio::test]
async fn test_run_timeout_recovers() {
    let mut config = config();
    config.execution = ExecutionConfig::with_timeout(Duration::from_secs(1));
    let manager = ExecutionManager::new(config);

    let output = manager.run("while (true) {}").await.unwrap();
    assert_eq!(output.len(), 1);
    assert!(output[0].payload.as_str().unwrap().contains("timed out"));

    let output = manager.run("console.log('alive')").await.unwrap();
    assert_eq!(output, vec![OutputEvent::new(OutputKind::Log, json!(["alive"]))]);
}

#[tokio::test]
async fn test_require_from_module_root() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("double.js"), "module.exports = (n) => n * 2;").unwrap();

    let mut config = config();
    config.worker.module_root = Some(dir.path().to_path_buf());
    let manager = ExecutionManager::new(config);

    let output = manager
        .run("console.log(require('double')(21))")
        .await
        .unwrap();
    assert_eq!(output, vec![OutputEvent::new(OutputKind::Log, json!([42]))]);
}

#[tokio::test]
async fn test_engine_internals_cannot_reach_protocol_stream() {
    let mut config = config();
    config.execution = ExecutionConfig::with_timeout(Duration::from_secs(20));
    let manager = ExecutionManager::new(config);

    let output = manager
        .run(r#"__bootstrap.core.print('{"x":', false); console.log(1)"#)
        .await
        .unwrap();
    assert_eq!(output.len(), 1);
    assert!(output[0].is_error());
    assert!(!output[0].payload.as_str().unwrap().contains("timed out"));

    let output = manager
        .run("console.log(typeof Deno, typeof __bootstrap, typeof __infra)")
        .await
        .unwrap();
    assert_eq!(
        output,
        vec![OutputEvent::new(
            OutputKind::Log,
            json!(["undefined", "undefined", "undefined"])
        )]
    );
}
