//! CLI command implementations

use anyhow::{anyhow, Context, Result};
use jsbox_common::OutputEvent;
use jsbox_kernel::{ExecutionManager, KernelConfig};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;

/// Initialise tracing: stderr always, plus a non-blocking file layer when
/// `log_file` is given. The returned guard must live until exit.
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "jsbox={},jsbox_kernel={},jsbox_common={}",
            log_level, log_level, log_level
        ))
    });

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("Invalid log file path: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

/// Explicit path, else the default location (falling back to defaults)
pub fn load_config(path: Option<&Path>) -> Result<KernelConfig> {
    let config = match path {
        Some(path) => KernelConfig::load_from(path)?,
        None => KernelConfig::load()?,
    };
    debug!(?config, "Loaded configuration");
    Ok(config)
}

/// One event per line: `<kind> <payload-json>`
pub fn format_event(event: &OutputEvent) -> String {
    format!("{} {}", event.kind, event.payload)
}

fn print_events(events: &[OutputEvent]) {
    for event in events {
        println!("{}", format_event(event));
    }
}

/// Execute one snippet. Returns whether any error event was produced.
pub async fn execute_run(
    config: KernelConfig,
    file: Option<PathBuf>,
    eval: Option<String>,
) -> Result<bool> {
    let code = match (file, eval) {
        (_, Some(code)) => code,
        (Some(file), None) => tokio::fs::read_to_string(&file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?,
        (None, None) => {
            let mut code = String::new();
            tokio::io::AsyncReadExt::read_to_string(&mut tokio::io::stdin(), &mut code)
                .await
                .context("Failed to read code from stdin")?;
            code
        }
    };

    let manager = ExecutionManager::new(config);
    let events = manager.run(code).await?;
    manager.terminate().await;

    print_events(&events);
    Ok(events.iter().any(OutputEvent::is_error))
}

/// What a REPL input line asks for
#[derive(Debug, PartialEq, Eq)]
pub enum ReplCommand<'a> {
    Run(&'a str),
    Reset,
    Exit,
    Empty,
}

pub fn parse_repl_line(line: &str) -> ReplCommand<'_> {
    match line.trim() {
        "" => ReplCommand::Empty,
        ".reset" => ReplCommand::Reset,
        ".exit" => ReplCommand::Exit,
        _ => ReplCommand::Run(line),
    }
}

/// Line-at-a-time session sharing one worker context
pub async fn execute_repl(config: KernelConfig) -> Result<()> {
    let manager = ExecutionManager::new(config);
    manager.warm_start().await?;
    info!(pid = manager.worker_pid().await, "REPL started");

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        match parse_repl_line(&line) {
            ReplCommand::Empty => continue,
            ReplCommand::Exit => break,
            ReplCommand::Reset => match manager.hard_reset().await {
                Ok(()) => println!("(context reset)"),
                Err(e) => eprintln!("✗ {} ({})", e, e.code()),
            },
            ReplCommand::Run(code) => match manager.run(code).await {
                Ok(events) => print_events(&events),
                Err(e) => eprintln!("✗ {} ({})", e, e.code()),
            },
        }
    }

    manager.terminate().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsbox_common::OutputKind;
    use serde_json::json;

    #[test]
    fn test_format_event() {
        let event = OutputEvent::new(OutputKind::Log, json!(["a", 1]));
        assert_eq!(format_event(&event), r#"log ["a",1]"#);

        let event = OutputEvent::new(OutputKind::GroupEnd, json!({}));
        assert_eq!(format_event(&event), "groupEnd {}");

        let event = OutputEvent::error_message("Uncaught Error: boom");
        assert_eq!(format_event(&event), r#"error "Uncaught Error: boom""#);
    }

    // The only test that installs the global subscriber.
    #[test]
    fn test_log_file_is_flushed_when_guard_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jsbox.log");

        let guard = init_logging(false, Some(&path)).unwrap();
        assert!(guard.is_some());
        tracing::error!(target: "jsbox", "worker pool drained");
        drop(guard);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("worker pool drained"));
    }

    #[test]
    fn test_parse_repl_line() {
        assert_eq!(parse_repl_line("  "), ReplCommand::Empty);
        assert_eq!(parse_repl_line(".reset"), ReplCommand::Reset);
        assert_eq!(parse_repl_line(" .exit "), ReplCommand::Exit);
        assert_eq!(parse_repl_line("console.log(1)"), ReplCommand::Run("console.log(1)"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[execution]\nrun_timeout = \"2s\"\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(
            config.execution.run_timeout,
            Some(std::time::Duration::from_secs(2))
        );
    }
}
