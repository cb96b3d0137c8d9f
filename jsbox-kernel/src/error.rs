//! Error types for the execution kernel

/// Result type for kernel operations
pub type Result<T> = std::result::Result<T, KernelError>;

/// Failures reported by the kernel as errors rather than as output.
///
/// Anything that goes wrong while a snippet runs (thrown exceptions, a worker
/// dying mid-run, a broken pipe) is delivered as an `error` output event
/// instead; only precondition and infrastructure failures land here.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// A run was requested while another one is still outstanding
    #[error("A run is already pending")]
    AlreadyPending,

    /// The worker process could not be started or never became ready
    #[error("Failed to spawn worker process: {0}")]
    ChildSpawnFailure(String),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O failure outside of a run
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol encoding failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KernelError {
    /// Stable failure code exposed to the request-handling layer
    pub fn code(&self) -> &'static str {
        match self {
            KernelError::AlreadyPending => "ALREADY_PENDING",
            KernelError::ChildSpawnFailure(_) => "CHILD_SPAWN_FAILURE",
            KernelError::Config(_) => "CONFIG_ERROR",
            KernelError::Io(_) => "IO_ERROR",
            KernelError::Json(_) => "JSON_ERROR",
        }
    }
}
