//! Error taxonomy for the render pipeline.
//!
//! Toolchain and engine failures are fatal to the enclosing job only and are
//! recorded on the job record. Persistence failures are logged where they
//! happen and never travel through this type.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    /// Rejected synchronously at submission, never enqueued.
    #[error("invalid input: {0}")]
    Input(String),

    /// Non-zero exit from an external media tool. Carries the exit code and
    /// the captured diagnostic text.
    #[error("{tool} exited with code {code}: {stderr}")]
    Toolchain {
        tool: &'static str,
        code: i32,
        stderr: String,
    },

    /// ffprobe ran but its output could not be interpreted.
    #[error("probe output malformed: {0}")]
    Probe(String),

    /// The rendering engine rejected the composition or died mid-render.
    #[error("render engine failed: {0}")]
    Engine(String),

    /// Not an error from the caller's point of view; the scheduler
    /// reclassifies any failure observed under a cancelled token.
    #[error("render cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toolchain_error_carries_exit_code_and_diagnostics() {
        let err = JobError::Toolchain {
            tool: "ffmpeg",
            code: 187,
            stderr: "Conversion failed!".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ffmpeg"));
        assert!(msg.contains("187"));
        assert!(msg.contains("Conversion failed!"));
    }

    #[test]
    fn cancelled_is_detectable() {
        assert!(JobError::Cancelled.is_cancelled());
        assert!(!JobError::Input("x".into()).is_cancelled());
    }
}
