//! Kernel configuration

use crate::capture::DEFAULT_CAPTURE_CAPACITY;
use crate::error::{KernelError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the worker binary looked up next to the current executable
pub const WORKER_BINARY_NAME: &str = "jsbox-worker";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    /// How worker processes are launched
    #[serde(default)]
    pub worker: WorkerCommandConfig,
    /// Per-run behaviour of the execution manager
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Worker process launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCommandConfig {
    /// Worker executable (None = `jsbox-worker` next to the current executable)
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Extra arguments passed before the kernel-managed ones
    #[serde(default)]
    pub args: Vec<String>,

    /// How long a freshly spawned worker may take to report ready
    #[serde(default = "WorkerCommandConfig::default_ready_timeout", with = "humantime_serde")]
    pub ready_timeout: Duration,

    /// Maximum number of output events kept per run
    #[serde(default = "WorkerCommandConfig::default_capture_capacity")]
    pub capture_capacity: usize,

    /// Directory `require()` resolves modules against (None = disabled)
    #[serde(default)]
    pub module_root: Option<PathBuf>,
}

impl Default for WorkerCommandConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            ready_timeout: Self::default_ready_timeout(),
            capture_capacity: Self::default_capture_capacity(),
            module_root: None,
        }
    }
}

impl WorkerCommandConfig {
    fn default_ready_timeout() -> Duration {
        Duration::from_secs(10)
    }

    fn default_capture_capacity() -> usize {
        DEFAULT_CAPTURE_CAPACITY
    }

    /// Launch a specific worker executable
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Executable to spawn
    pub fn resolve_program(&self) -> Result<PathBuf> {
        if let Some(program) = &self.program {
            return Ok(program.clone());
        }
        let current = std::env::current_exe()?;
        let dir = current.parent().ok_or_else(|| {
            KernelError::Config(format!(
                "Cannot determine directory of {}",
                current.display()
            ))
        })?;
        Ok(dir.join(format!("{}{}", WORKER_BINARY_NAME, std::env::consts::EXE_SUFFIX)))
    }

    /// Full argument list: configured args followed by the kernel-managed flags
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--capacity".to_string());
        args.push(self.capture_capacity.to_string());
        if let Some(root) = &self.module_root {
            args.push("--module-root".to_string());
            args.push(root.display().to_string());
        }
        args
    }
}

/// Execution manager settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound for one run; exceeding it hard-resets the worker.
    /// None keeps a run waiting until the worker replies or is terminated.
    #[serde(default, with = "humantime_serde")]
    pub run_timeout: Option<Duration>,
}

impl ExecutionConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            run_timeout: Some(timeout),
        }
    }
}

impl KernelConfig {
    /// Load from the default location, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KernelError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML content
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: KernelConfig = toml::from_str(content)
            .map_err(|e| KernelError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| KernelError::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(".config").join("jsbox").join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.capture_capacity == 0 {
            return Err(KernelError::Config(
                "worker.capture_capacity must be at least 1".to_string(),
            ));
        }
        if self.worker.ready_timeout.is_zero() {
            return Err(KernelError::Config(
                "worker.ready_timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(root) = &self.worker.module_root {
            if !root.is_dir() {
                return Err(KernelError::Config(format!(
                    "worker.module_root {} is not a directory",
                    root.display()
                )));
            }
        }
        Ok(())
    }
}
