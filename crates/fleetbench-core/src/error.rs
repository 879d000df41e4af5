//! Run-level error taxonomy and exit-code mapping.

use thiserror::Error;

/// Error that ends a benchmark run. The coordinator translates this into the
/// process exit code; detail for worker failures is already in the error
/// history, so `Worker` carries no message of its own.
#[derive(Debug, Error)]
pub enum RunError {
    /// Invalid flags, unparseable config, or inconsistent service path infos.
    #[error("{0}")]
    Config(String),
    /// User signal observed at a phase boundary.
    #[error("Terminating due to interrupt signal.")]
    Interrupted,
    /// Per-phase time limit expired. Informational, not a run failure.
    #[error("Terminating due to phase time limit.")]
    TimeLimit,
    /// One or more workers failed; diagnostics are in the error history.
    #[error("one or more workers failed")]
    Worker,
    /// HTTP version mismatch, missing parameter, or malformed payload.
    #[error("{0}")]
    Protocol(String),
}

impl RunError {
    /// Exit code for this error. Time-limit expiry alone is a success.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::TimeLimit => 0,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_limit_is_not_a_failure() {
        assert_eq!(RunError::TimeLimit.exit_code(), 0);
        assert_eq!(RunError::Interrupted.exit_code(), 1);
        assert_eq!(RunError::Worker.exit_code(), 1);
        assert_eq!(RunError::Config("x".into()).exit_code(), 1);
    }
}
