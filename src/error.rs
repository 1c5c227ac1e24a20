//! Error types
//!
//! One enum per concern. Binary glue wraps these in `anyhow`; library code
//! returns them directly so callers can tell fatal from absorbable failures.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single test-tool invocation.
#[derive(Debug, Error)]
pub enum RunError {
    /// The process could not be started at all.
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A standard stream was not captured.
    #[error("failed to capture {stream} of the test process")]
    Pipe { stream: &'static str },

    /// Reading one of the output streams failed mid-run.
    #[error("failed to read {stream}: {source}")]
    Stream {
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    /// Waiting for the process failed for a reason other than its exit code.
    #[error("test process failed unexpectedly: {0}")]
    Wait(#[source] io::Error),
}

impl RunError {
    /// Whether this error means the process never ran.
    pub fn is_startup(&self) -> bool {
        matches!(self, RunError::Spawn { .. } | RunError::Pipe { .. })
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus is shut down")]
    Closed,

    #[error("publish cancelled")]
    Cancelled,
}

/// Failure-set persistence errors.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("no per-user cache directory available")]
    NoCacheDir,

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed failure set in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("file watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("failed to walk {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to execute `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("package listing failed: {stderr}")]
    Failed { stderr: String },

    #[error("failed to parse package listing: {0}")]
    Parse(#[from] serde_json::Error),
}
