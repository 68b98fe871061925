//! Job and step records with their state machines.
//!
//! A `Job` is one unit of end-to-end work decomposed into an ordered,
//! fixed-length sequence of named `Step`s. The transition methods here are
//! the only place status side effects live; the driver and the recovery
//! scanner both mutate jobs exclusively through them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Status of a job as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Input accepted, no step has run yet.
    #[default]
    Uploaded,
    /// At least one step remains runnable; also the state a job returns to
    /// when a single step fails (the job stays retryable).
    Pending,
    /// A step is executing or about to.
    Processing,
    /// Every step completed.
    Completed,
    /// The driver itself aborted (persistence or setup failure, not a
    /// stage error). Terminal until externally re-triggered.
    Failed,
}

impl JobStatus {
    /// Get display string for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Status of a single pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One named unit of external processing within a job's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Stable stage identifier, resolved against the stage registry.
    pub name: String,
    /// Current status.
    pub status: StepStatus,
    /// Coarse progress proxy: 0 (not started), 50 (in flight), 100 (done).
    pub progress: u8,
    /// When the step last entered `processing` (RFC 3339 UTC).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// When the step last entered `completed` (RFC 3339 UTC).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// Last failure message; present only while `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Opaque stage-supplied result summary. Mutually exclusive with
    /// `error` for any given attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Step {
    /// Create a pending step for the given stage name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            progress: 0,
            started_at: None,
            completed_at: None,
            error: None,
            details: None,
        }
    }

    /// Enter `processing`. Clears any previous failure so a retry starts
    /// from a clean attempt slot.
    pub fn begin(&mut self) {
        self.status = StepStatus::Processing;
        self.progress = 50;
        self.started_at = Some(now_rfc3339());
        self.completed_at = None;
        self.error = None;
    }

    /// Enter `completed` with the stage's result summary.
    pub fn complete(&mut self, details: serde_json::Value) {
        self.status = StepStatus::Completed;
        self.progress = 100;
        self.completed_at = Some(now_rfc3339());
        self.error = None;
        self.details = Some(details);
    }

    /// Enter `failed` with the attempt's error message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.progress = 0;
        self.completed_at = None;
        self.error = Some(message.into());
        self.details = None;
    }

    /// Reset to a pristine `pending` state (forced restart).
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.progress = 0;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.details = None;
    }

    /// Whether this step has completed.
    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// One unit of end-to-end work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique identifier, assigned at creation, immutable.
    pub id: String,
    /// Aggregate status.
    pub status: JobStatus,
    /// Derived progress 0-100; always recomputed from step completion,
    /// never authoritative on its own.
    pub progress: u8,
    /// Ordered steps. Fixed length and identity for the job's lifetime.
    pub steps: Vec<Step>,
    /// Last fatal message; cleared whenever the job re-enters processing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the job first entered processing (RFC 3339 UTC).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Set only on full completion (RFC 3339 UTC).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// Final output location; set only when every step is completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

impl Job {
    /// Create a new job with all steps pending.
    pub fn new(id: impl Into<String>, step_names: &[&str]) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Uploaded,
            progress: 0,
            steps: step_names.iter().map(|name| Step::new(*name)).collect(),
            error: None,
            started_at: None,
            completed_at: None,
            output_path: None,
        }
    }

    /// Enter `processing`: clears the job-level error and stamps the first
    /// start time.
    pub fn begin(&mut self) {
        self.status = JobStatus::Processing;
        self.error = None;
        if self.started_at.is_none() {
            self.started_at = Some(now_rfc3339());
        }
    }

    /// Finalize a fully-completed job.
    pub fn finish(&mut self, output_path: PathBuf) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.completed_at = Some(now_rfc3339());
        self.error = None;
        self.output_path = Some(output_path);
    }

    /// Record a driver-level abort. Stage failures never come through
    /// here; they go through `record_step_failure` and leave the job
    /// `pending`.
    pub fn abort(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(message.into());
    }

    /// Recompute derived progress from step completion.
    pub fn refresh_progress(&mut self) {
        self.progress = if self.steps.is_empty() {
            0
        } else {
            let completed = self.completed_steps() as f64;
            ((100.0 * completed) / self.steps.len() as f64).round() as u8
        };
    }

    /// Start executing a step: the step enters `processing` and so does
    /// the job.
    pub fn begin_step(&mut self, step_index: usize) {
        self.steps[step_index].begin();
        self.begin();
    }

    /// Record a step's successful result and refresh derived progress.
    pub fn record_step_completion(&mut self, step_index: usize, details: serde_json::Value) {
        self.steps[step_index].complete(details);
        self.refresh_progress();
    }

    /// Record a step failure. The job drops back to `pending`, not
    /// `failed`: other steps and a retry of this one stay reachable, and
    /// job-level `failed` is reserved for driver aborts.
    pub fn record_step_failure(&mut self, step_index: usize, message: impl Into<String>) {
        self.steps[step_index].fail(message);
        self.refresh_progress();
        self.status = JobStatus::Pending;
    }

    /// Number of completed steps.
    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.is_completed()).count()
    }

    /// Whether every step has completed.
    pub fn all_steps_completed(&self) -> bool {
        self.steps.iter().all(|s| s.is_completed())
    }

    /// Whether this job was left mid-flight (interesting to the recovery
    /// scanner after a restart).
    pub fn is_interrupted(&self) -> bool {
        self.status == JobStatus::Processing
            || self.steps.iter().any(|s| s.status == StepStatus::Processing)
    }

    /// The first step the pipeline driver will (re)attempt: an
    /// interrupted `processing` step wins, otherwise the first step that
    /// is not yet `completed`. Returns `steps.len()` when nothing is left.
    pub fn resume_index(&self) -> usize {
        if let Some(idx) = self
            .steps
            .iter()
            .position(|s| s.status == StepStatus::Processing)
        {
            return idx;
        }
        self.steps
            .iter()
            .position(|s| !s.is_completed())
            .unwrap_or(self.steps.len())
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
