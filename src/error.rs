use std::path::PathBuf;

use thiserror::Error;

/// Setup-time failures. These abort a stage before any job is submitted.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Required input not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("Root directory not found: {}", .0.display())]
    MissingRoot(PathBuf),

    #[error("Worklist already exists at {}. Pass --force to regenerate it.", .0.display())]
    WorklistExists(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Why a single job did not reach a verified completion.
///
/// Every variant is recorded to the `failed` journal and leaves the item
/// eligible for retry on the next run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    /// The external program could not be started at all.
    #[error("failed to spawn [{command}]: {message}")]
    Spawn { command: String, message: String },

    /// The external program ran but did not exit with code 0.
    #[error("process returned {status} [{command}]")]
    NonZeroExit { command: String, status: String },

    #[error("expected output is missing: {}", .0.display())]
    MissingOutput(PathBuf),

    /// Exit code 0 with a zero-byte output still counts as failure.
    #[error("expected output is empty: {}", .0.display())]
    EmptyOutput(PathBuf),

    /// Output directory holds a file the packager should not have produced.
    #[error("unexpected file in output: {}", .0.display())]
    UnexpectedOutput(PathBuf),

    /// Tool output could not be interpreted (e.g. no loudnorm JSON block).
    #[error("unreadable measurement: {0}")]
    Measurement(String),

    #[error("filesystem error: {0}")]
    Io(String),

    #[error("ledger write failed: {0}")]
    Ledger(String),

    /// The job function panicked; caught at the worker boundary.
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl From<std::io::Error> for JobFailure {
    fn from(e: std::io::Error) -> Self {
        JobFailure::Io(e.to_string())
    }
}
