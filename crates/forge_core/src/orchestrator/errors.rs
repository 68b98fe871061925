//! Error types for the orchestration engine.
//!
//! Errors carry context that chains through layers:
//! Job → Step → Stage operation → Detail
//!
//! The two layers encode the engine's dual failure vocabulary: a
//! `StageError` is recorded on its step and leaves the job `pending`
//! (retryable); every other `PipelineError` variant is a driver-level
//! failure that marks the whole job `failed`.

use thiserror::Error;

/// Top-level pipeline error with job context.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage operation failed during step execution.
    #[error("Job '{job_id}' failed at step '{step_name}': {source}")]
    StepFailed {
        job_id: String,
        step_name: String,
        #[source]
        source: StageError,
    },

    /// The requested job does not exist.
    #[error("Job '{job_id}' not found")]
    JobNotFound { job_id: String },

    /// The requested step index is out of range.
    #[error("Job '{job_id}' has no step {step_index}")]
    StepOutOfRange { job_id: String, step_index: usize },

    /// A step was triggered before its predecessor completed, or a
    /// completed step was re-triggered without a forced restart.
    #[error("Job '{job_id}' step {step_index} is not ready: {message}")]
    StepNotReady {
        job_id: String,
        step_index: usize,
        message: String,
    },

    /// No operation is registered for a step's stage name.
    #[error("No operation registered for stage '{stage}'")]
    UnknownStage { stage: String },

    /// Failed to set up the job run (create directories, open log, etc.).
    #[error("Job '{job_id}' setup failed: {message}")]
    SetupFailed { job_id: String, message: String },
}

impl PipelineError {
    /// Create a step failed error.
    pub fn step_failed(
        job_id: impl Into<String>,
        step_name: impl Into<String>,
        source: StageError,
    ) -> Self {
        Self::StepFailed {
            job_id: job_id.into(),
            step_name: step_name.into(),
            source,
        }
    }

    /// Create a job not found error.
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            job_id: job_id.into(),
        }
    }

    /// Create a step not ready error.
    pub fn step_not_ready(
        job_id: impl Into<String>,
        step_index: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::StepNotReady {
            job_id: job_id.into(),
            step_index,
            message: message.into(),
        }
    }

    /// Create a setup failed error.
    pub fn setup_failed(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SetupFailed {
            job_id: job_id.into(),
            message: message.into(),
        }
    }

    /// Whether this is a retryable stage failure (step recorded it, job
    /// stays `pending`) as opposed to a driver-level abort.
    pub fn is_stage_failure(&self) -> bool {
        matches!(self, Self::StepFailed { .. })
    }
}

/// Error from a stage operation.
///
/// Cloneable by design: callers that join an in-flight execution receive
/// the same failure as the caller that started it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// An external command failed.
    #[error("{tool} failed with exit code {exit_code}: {message}")]
    CommandFailed {
        tool: String,
        exit_code: i32,
        message: String,
    },

    /// File I/O error with operation context.
    #[error("I/O error in {operation}: {message}")]
    Io { operation: String, message: String },

    /// A required file was not found.
    #[error("Required file not found: {path}")]
    FileNotFound { path: String },

    /// Every strategy in a fallback chain failed.
    #[error("All {attempts} strategies for stage '{stage}' failed: {last_error}")]
    Exhausted {
        stage: String,
        attempts: usize,
        last_error: String,
    },

    /// Generic stage error with message.
    #[error("{0}")]
    Other(String),
}

impl StageError {
    /// Create a command failed error.
    pub fn command_failed(
        tool: impl Into<String>,
        exit_code: i32,
        message: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            tool: tool.into(),
            exit_code,
            message: message.into(),
        }
    }

    /// Create an I/O error with context.
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            message: source.to_string(),
        }
    }

    /// Create a file not found error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Create a generic error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// Result type for stage operations.
pub type StageResult<T> = Result<T, StageError>;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_displays_context() {
        let err = StageError::command_failed("ffmpeg", 2, "invalid stream");
        let msg = err.to_string();
        assert!(msg.contains("ffmpeg"));
        assert!(msg.contains("exit code 2"));
        assert!(msg.contains("invalid stream"));
    }

    #[test]
    fn pipeline_error_chains_context() {
        let stage_err = StageError::file_not_found("/media/input.wav");
        let pipeline_err = PipelineError::step_failed("job-7", "transcribe", stage_err);

        let msg = pipeline_err.to_string();
        assert!(msg.contains("job-7"));
        assert!(msg.contains("transcribe"));
        assert!(pipeline_err.is_stage_failure());
    }

    #[test]
    fn driver_errors_are_not_stage_failures() {
        assert!(!PipelineError::job_not_found("job-7").is_stage_failure());
        assert!(!PipelineError::setup_failed("job-7", "mkdir failed").is_stage_failure());
    }
}
