//! Stage operation trait and registry.
//!
//! A stage operation is the seam between the orchestration engine and an
//! external media engine. The engine assumes nothing beyond "runs
//! asynchronously, returns an opaque details summary or an error".

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::errors::StageResult;
use crate::config::Settings;
use crate::logging::JobLogger;
use crate::models::Job;

/// Execution context passed to a stage operation.
///
/// Read-only from the stage's perspective: stages report results through
/// their return value, never by mutating job state directly.
pub struct StageContext {
    /// Snapshot of the job at the time the step started.
    pub job: Job,
    /// Index of the step being executed.
    pub step_index: usize,
    /// Application settings.
    pub settings: Settings,
    /// Job-specific working directory (under the work root).
    pub work_dir: PathBuf,
    /// Output directory for finished media.
    pub output_dir: PathBuf,
    /// Per-job logger.
    pub logger: Arc<JobLogger>,
}

impl StageContext {
    /// Name of the step being executed.
    pub fn step_name(&self) -> &str {
        &self.job.steps[self.step_index].name
    }
}

/// Trait for stage operations.
///
/// Implementations wrap external processing (transcoding, transcription,
/// synthesis, compositing). The operation either succeeds and returns an
/// opaque details value recorded on the step, or fails with a
/// `StageError` recorded on the step.
#[async_trait]
pub trait StageOperation: Send + Sync {
    /// Stage name this operation serves (matched against step names).
    fn name(&self) -> &str;

    /// Execute the stage's work.
    ///
    /// Suspends on the external operation's completion; the driver never
    /// busy-waits. Output paths must use overwrite semantics so a retried
    /// attempt is not corrupted by a previous partial run.
    async fn run(&self, ctx: &StageContext) -> StageResult<serde_json::Value>;
}

/// Name → operation table the driver resolves step names against.
#[derive(Default, Clone)]
pub struct StageRegistry {
    ops: HashMap<String, Arc<dyn StageOperation>>,
}

impl StageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation under its own stage name.
    ///
    /// Replaces any previous registration for the same name.
    pub fn register(&mut self, op: Arc<dyn StageOperation>) {
        self.ops.insert(op.name().to_string(), op);
    }

    /// Register an operation (builder pattern).
    pub fn with(mut self, op: Arc<dyn StageOperation>) -> Self {
        self.register(op);
        self
    }

    /// Look up the operation for a stage name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn StageOperation>> {
        self.ops.get(name).cloned()
    }

    /// Registered stage names (unordered).
    pub fn names(&self) -> Vec<&str> {
        self.ops.keys().map(|s| s.as_str()).collect()
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
