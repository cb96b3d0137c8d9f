mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "jsbox")]
#[command(about = "Run JavaScript in an isolated worker process")]
#[command(version)]
pub struct Cli {
    /// Config file (default: ~/.config/jsbox/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a script file or inline code once
    Run {
        /// Script file to execute
        file: Option<PathBuf>,

        /// Inline code (instead of a file)
        #[arg(short, long, conflicts_with = "file")]
        eval: Option<String>,
    },
    /// Interactive session against one persistent worker (default)
    Repl,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    // Dropped on return so the file layer flushes before exit.
    let _log_guard = commands::init_logging(cli.verbose, cli.log_file.as_deref())?;
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Run { file, eval }) => {
            let failed = commands::execute_run(config, file, eval).await?;
            Ok(if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Some(Commands::Repl) | None => {
            commands::execute_repl(config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
