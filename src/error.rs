//! Error taxonomy of the build pipeline

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the registry and executor.
///
/// Every variant is recoverable at the registry boundary: a failed build
/// leaves its entry in a terminal state and never corrupts other entries.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Caller-supplied project identity failed the validity check
    #[error("invalid project: {0}")]
    InvalidProject(String),

    /// No build manifest on disk where one was expected
    #[error("build manifest not found at {}", path.display())]
    InvalidProjectPath { path: PathBuf },

    /// The OS refused to create the child process
    #[error("failed to spawn build process: {source}")]
    ProcessSpawnFailed {
        #[source]
        source: io::Error,
    },

    /// Nonzero exit, signal termination, or a wait failure.
    /// `exit_code` is `None` when the child was killed by a signal or
    /// could not be reaped.
    #[error("build failed (exit code {exit_code:?})")]
    BuildFailed { exit_code: Option<i32> },

    /// The caller cancelled the build; the child process was terminated
    #[error("build cancelled")]
    Cancelled,

    /// The configured deadline expired; the child process was terminated
    #[error("build timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BuildError::InvalidProjectPath {
            path: PathBuf::from("/tmp/demo/build.zig"),
        };
        assert_eq!(
            err.to_string(),
            "build manifest not found at /tmp/demo/build.zig"
        );

        let err = BuildError::BuildFailed { exit_code: Some(2) };
        assert!(err.to_string().contains("exit code"));
    }
}
