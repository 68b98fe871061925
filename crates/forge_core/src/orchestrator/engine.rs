//! Orchestration engine: the pipeline driver and its external interface.
//!
//! The engine advances a job from its resume point to completion one step
//! at a time, honoring the dependency order. Two failure vocabularies are
//! deliberate: a stage failure is recorded on its step and drops the job
//! back to `pending` so the trigger layer can retry just that step; only
//! errors outside stage execution (setup, unknown stage, persistence)
//! mark the whole job `failed`.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Settings;
use crate::jobs::JobStore;
use crate::logging::JobLogger;
use crate::models::{Job, JobStatus};
use crate::process::{NullProbe, ProcessProbe, SystemProcessProbe};

use super::errors::{PipelineError, PipelineResult};
use super::locks::{LockKey, LockManager};
use super::recovery::{RecoveryReport, RecoveryScanner};
use super::stage::{StageContext, StageRegistry};

/// Job/step orchestration engine.
///
/// One engine instance serves the whole process. Per-job pipeline runs
/// are independent async tasks; duplicate triggers for the same
/// (job, step) pair join the in-flight execution via the lock manager
/// instead of starting redundant work.
pub struct Engine {
    settings: Settings,
    store: Arc<JobStore>,
    registry: StageRegistry,
    locks: Arc<LockManager>,
    probe: Arc<dyn ProcessProbe>,
    recovery: RecoveryScanner,
}

impl Engine {
    /// Create an engine over the given store and stage registry.
    pub fn new(settings: Settings, store: Arc<JobStore>, registry: StageRegistry) -> Self {
        let probe: Arc<dyn ProcessProbe> = if settings.engine.probe_processes {
            Arc::new(SystemProcessProbe::new())
        } else {
            Arc::new(NullProbe)
        };
        let recovery = RecoveryScanner::from_settings(&settings);

        Self {
            settings,
            store,
            registry,
            locks: Arc::new(LockManager::new()),
            probe,
            recovery,
        }
    }

    /// Replace the process-liveness probe (builder pattern).
    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Create a new job with the given stage names, all steps pending.
    pub fn create_job(&self, step_names: &[&str]) -> Job {
        let job = Job::new(uuid::Uuid::new_v4().to_string(), step_names);
        tracing::info!("Created job {} with {} steps", job.id, job.steps.len());

        self.store.set(job.clone());
        self.store.persist();
        job
    }

    /// Read-only snapshot of a job for progress polling.
    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.store.get(job_id)
    }

    /// Snapshot of all jobs.
    pub fn jobs(&self) -> Vec<Job> {
        self.store.jobs()
    }

    /// Currently in-flight (job, step) executions.
    pub fn active_locks(&self) -> Vec<LockKey> {
        self.locks.active_keys()
    }

    /// Run the pipeline from the job's current resume point.
    ///
    /// Idempotent to call while already running: each step execution is
    /// deduplicated per (job, step) key, so a duplicate call joins the
    /// in-flight step and continues from wherever it left the job.
    pub async fn run_pipeline(&self, job_id: &str) -> PipelineResult<Job> {
        match self.drive(job_id).await {
            Ok(job) => Ok(job),
            Err(err) => Err(self.convert_failure(job_id, err)),
        }
    }

    /// Run exactly one step.
    ///
    /// Rejects if a prior step is incomplete, or if the target step
    /// already completed, unless `force_restart` is set. A forced restart
    /// resets the target step's state before execution; cleaning
    /// downstream artifacts is the trigger layer's concern.
    pub async fn run_step(
        &self,
        job_id: &str,
        step_index: usize,
        force_restart: bool,
    ) -> PipelineResult<Job> {
        let job = self
            .store
            .get(job_id)
            .ok_or_else(|| PipelineError::job_not_found(job_id))?;

        if step_index >= job.steps.len() {
            return Err(PipelineError::StepOutOfRange {
                job_id: job_id.to_string(),
                step_index,
            });
        }

        if !force_restart {
            if let Some(prev) = step_index.checked_sub(1) {
                if !job.steps[prev].is_completed() {
                    return Err(PipelineError::step_not_ready(
                        job_id,
                        step_index,
                        format!("previous step '{}' is not completed", job.steps[prev].name),
                    ));
                }
            }
            if job.steps[step_index].is_completed() {
                return Err(PipelineError::step_not_ready(
                    job_id,
                    step_index,
                    "step already completed; use force_restart to run it again",
                ));
            }
        } else {
            self.store.update(job_id, |job| {
                job.steps[step_index].reset();
                if job.status == JobStatus::Completed {
                    job.status = JobStatus::Pending;
                    job.completed_at = None;
                    job.output_path = None;
                }
                job.refresh_progress();
            });
            self.store.persist();
        }

        let job = self
            .store
            .get(job_id)
            .ok_or_else(|| PipelineError::job_not_found(job_id))?;

        match self.execute_step(&job, step_index).await {
            Ok(_) => {
                let mut job = self.finalize(job_id)?;
                // A lone step run leaves nothing executing; drop the job
                // back to pending unless another trigger still holds one
                // of its steps.
                if job.status == JobStatus::Processing
                    && !self
                        .locks
                        .active_keys()
                        .iter()
                        .any(|key| key.job_id == job_id)
                {
                    if let Some(updated) = self
                        .store
                        .update(job_id, |job| job.status = JobStatus::Pending)
                    {
                        self.store.persist();
                        job = updated;
                    }
                }
                Ok(job)
            }
            Err(err) => Err(self.convert_failure(job_id, err)),
        }
    }

    /// Resume jobs left mid-flight by a previous process instance.
    ///
    /// Runs at most once per engine lifetime, after a short grace delay
    /// so freshly-triggered executions can register their locks first.
    pub async fn recover_interrupted(&self) -> RecoveryReport {
        self.recovery.scan(self).await
    }

    /// Walk the job's steps from the resume point.
    async fn drive(&self, job_id: &str) -> PipelineResult<Job> {
        let job = self
            .store
            .get(job_id)
            .ok_or_else(|| PipelineError::job_not_found(job_id))?;

        let resume = job.resume_index();
        let total = job.steps.len();
        if resume < total {
            tracing::info!("Running job {} from step {}/{}", job_id, resume + 1, total);
        }

        for step_index in resume..total {
            let job = self
                .store
                .get(job_id)
                .ok_or_else(|| PipelineError::job_not_found(job_id))?;

            // A joined duplicate run may have completed this step already
            if job.steps[step_index].is_completed() {
                continue;
            }

            self.execute_step(&job, step_index).await?;
        }

        self.finalize(job_id)
    }

    /// Execute one step under its (job, step) lock.
    ///
    /// All state mutation happens inside the registered work, which runs
    /// exactly once per in-flight key; callers that join an existing
    /// execution only observe its outcome.
    async fn execute_step(&self, job: &Job, step_index: usize) -> PipelineResult<serde_json::Value> {
        let step_name = job.steps[step_index].name.clone();
        let op = self
            .registry
            .get(&step_name)
            .ok_or_else(|| PipelineError::UnknownStage {
                stage: step_name.clone(),
            })?;

        let ctx = self.stage_context(job, step_index)?;
        let key = LockKey::new(&job.id, step_index);

        let store = Arc::clone(&self.store);
        let job_id = job.id.clone();
        let name = step_name.clone();

        let work = async move {
            store.update(&job_id, |job| job.begin_step(step_index));
            store.persist();

            ctx.logger.stage(&name);

            match op.run(&ctx).await {
                Ok(details) => {
                    ctx.logger.success(&format!("{} completed", name));
                    store.update(&job_id, |job| {
                        job.record_step_completion(step_index, details.clone());
                    });
                    store.persist();
                    Ok(details)
                }
                Err(err) => {
                    ctx.logger.error(&format!("{} failed: {}", name, err));
                    ctx.logger.show_tail(&name);
                    store.update(&job_id, |job| {
                        job.record_step_failure(step_index, err.to_string());
                    });
                    store.persist();
                    Err(err)
                }
            }
        };

        self.locks
            .acquire_or_join(key, work)
            .await
            .map_err(|e| PipelineError::step_failed(&job.id, &step_name, e))
    }

    /// Finalize the job if every step has completed.
    fn finalize(&self, job_id: &str) -> PipelineResult<Job> {
        let output_root = PathBuf::from(&self.settings.paths.output_folder);

        let updated = self
            .store
            .update(job_id, |job| {
                if job.all_steps_completed() && job.status != JobStatus::Completed {
                    let output_path = job
                        .steps
                        .last()
                        .and_then(|s| s.details.as_ref())
                        .and_then(|d| d.get("output_path"))
                        .and_then(|v| v.as_str())
                        .map(PathBuf::from)
                        .unwrap_or_else(|| output_root.join(&job.id));

                    tracing::info!("Job {} completed: {}", job.id, output_path.display());
                    job.finish(output_path);
                }
            })
            .ok_or_else(|| PipelineError::job_not_found(job_id))?;

        self.store.persist();
        Ok(updated)
    }

    /// Build the execution context for one step, creating the job's work
    /// directory and log file.
    fn stage_context(&self, job: &Job, step_index: usize) -> PipelineResult<StageContext> {
        let work_dir = PathBuf::from(&self.settings.paths.work_root).join(&job.id);
        fs::create_dir_all(&work_dir).map_err(|e| {
            PipelineError::setup_failed(&job.id, format!("Failed to create work directory: {}", e))
        })?;

        let logger = JobLogger::new(
            &job.id,
            &self.settings.paths.logs_folder,
            self.settings.logging.to_log_config(),
            None,
        )
        .map_err(|e| {
            PipelineError::setup_failed(&job.id, format!("Failed to create logger: {}", e))
        })?;

        Ok(StageContext {
            job: job.clone(),
            step_index,
            settings: self.settings.clone(),
            work_dir,
            output_dir: PathBuf::from(&self.settings.paths.output_folder),
            logger: Arc::new(logger),
        })
    }

    /// Convert a run failure into job state.
    ///
    /// Stage failures were already recorded on their step (job stays
    /// `pending`); anything else is a driver-level abort.
    fn convert_failure(&self, job_id: &str, err: PipelineError) -> PipelineError {
        if !err.is_stage_failure() {
            tracing::error!("Job {} aborted: {}", job_id, err);
            self.store.update(job_id, |job| job.abort(err.to_string()));
            self.store.persist();
        }
        err
    }

    pub(crate) fn store(&self) -> &JobStore {
        &self.store
    }

    pub(crate) fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    pub(crate) fn probe(&self) -> &dyn ProcessProbe {
        self.probe.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepStatus;
    use crate::orchestrator::errors::StageError;
    use crate::orchestrator::stage::StageOperation;
    use crate::orchestrator::stages::FnStage;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_settings(dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.paths.state_file = dir.join("jobs.json").to_string_lossy().to_string();
        settings.paths.work_root = dir.join("work").to_string_lossy().to_string();
        settings.paths.output_folder = dir.join("out").to_string_lossy().to_string();
        settings.paths.logs_folder = dir.join("logs").to_string_lossy().to_string();
        settings.engine.probe_processes = false;
        settings.engine.recovery_grace_secs = 0;
        settings
    }

    fn counting_stage(name: &str, counter: Arc<AtomicUsize>) -> Arc<dyn StageOperation> {
        let name = name.to_string();
        Arc::new(FnStage::new(name, move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({"ran": true}))
            }
        }))
    }

    fn failing_stage(name: &str) -> Arc<dyn StageOperation> {
        Arc::new(FnStage::new(name.to_string(), |_ctx| async {
            Err(StageError::command_failed("media-engine", 1, "segfault"))
        }))
    }

    /// Engine over an in-memory store with three counting stages.
    fn counting_engine(dir: &Path) -> (Engine, [Arc<AtomicUsize>; 3]) {
        let counters = [
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        ];
        let registry = StageRegistry::new()
            .with(counting_stage("transcode", Arc::clone(&counters[0])))
            .with(counting_stage("transcribe", Arc::clone(&counters[1])))
            .with(counting_stage("composite", Arc::clone(&counters[2])));

        let engine = Engine::new(
            test_settings(dir),
            Arc::new(JobStore::in_memory()),
            registry,
        );
        (engine, counters)
    }

    const STEPS: [&str; 3] = ["transcode", "transcribe", "composite"];

    #[test]
    fn create_job_starts_with_pending_steps() {
        let dir = tempdir().unwrap();
        let (engine, _counters) = counting_engine(dir.path());

        let job = engine.create_job(&STEPS);

        assert_eq!(job.status, JobStatus::Uploaded);
        assert_eq!(job.progress, 0);
        assert_eq!(job.steps.len(), 3);
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(engine.job(&job.id).unwrap().id, job.id);
    }

    #[tokio::test]
    async fn run_pipeline_completes_every_step() {
        let dir = tempdir().unwrap();
        let (engine, counters) = counting_engine(dir.path());
        let job = engine.create_job(&STEPS);

        let done = engine.run_pipeline(&job.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());
        assert!(done.steps.iter().all(|s| s.is_completed()));
        assert!(done.steps.iter().all(|s| s.details.is_some()));
        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        assert!(engine.active_locks().is_empty());
    }

    #[tokio::test]
    async fn output_path_comes_from_final_step_details() {
        let dir = tempdir().unwrap();
        let registry = StageRegistry::new().with(Arc::new(FnStage::new("composite", |_ctx| {
            async { Ok(serde_json::json!({"output_path": "/media/final.mp4"})) }
        })));
        let engine = Engine::new(
            test_settings(dir.path()),
            Arc::new(JobStore::in_memory()),
            registry,
        );

        let job = engine.create_job(&["composite"]);
        let done = engine.run_pipeline(&job.id).await.unwrap();

        assert_eq!(done.output_path.unwrap(), PathBuf::from("/media/final.mp4"));
    }

    #[tokio::test]
    async fn pipeline_resumes_after_reload_without_rerunning_completed_steps() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let state_file = settings.paths.state_file.clone();

        // First process: complete step 0, then "crash"
        let job_id = {
            let counters = Arc::new(AtomicUsize::new(0));
            let registry = StageRegistry::new()
                .with(counting_stage("transcode", Arc::clone(&counters)))
                .with(counting_stage("transcribe", Arc::new(AtomicUsize::new(0))))
                .with(counting_stage("composite", Arc::new(AtomicUsize::new(0))));
            let engine = Engine::new(
                settings.clone(),
                Arc::new(JobStore::new(&state_file)),
                registry,
            );

            let job = engine.create_job(&STEPS);
            engine.run_step(&job.id, 0, false).await.unwrap();
            job.id
        };

        // Second process: reload from the persisted table
        let counters = [
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        ];
        let registry = StageRegistry::new()
            .with(counting_stage("transcode", Arc::clone(&counters[0])))
            .with(counting_stage("transcribe", Arc::clone(&counters[1])))
            .with(counting_stage("composite", Arc::clone(&counters[2])));
        let engine = Engine::new(settings, Arc::new(JobStore::new(&state_file)), registry);

        let done = engine.run_pipeline(&job_id).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(counters[0].load(Ordering::SeqCst), 0);
        assert_eq!(counters[1].load(Ordering::SeqCst), 1);
        assert_eq!(counters[2].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn step_failure_leaves_earlier_steps_intact() {
        let dir = tempdir().unwrap();
        let first = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let registry = StageRegistry::new()
            .with(counting_stage("transcode", Arc::clone(&first)))
            .with(failing_stage("transcribe"))
            .with(counting_stage("composite", Arc::clone(&third)));
        let engine = Engine::new(
            test_settings(dir.path()),
            Arc::new(JobStore::in_memory()),
            registry,
        );

        let job = engine.create_job(&STEPS);
        let err = engine.run_pipeline(&job.id).await.unwrap_err();

        assert!(err.is_stage_failure());

        let job = engine.job(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_none());
        assert_eq!(job.steps[0].status, StepStatus::Completed);
        assert_eq!(job.steps[1].status, StepStatus::Failed);
        assert!(job.steps[1].error.as_deref().unwrap().contains("segfault"));
        assert_eq!(job.steps[2].status, StepStatus::Pending);
        assert_eq!(third.load(Ordering::SeqCst), 0);
        assert_eq!(job.progress, 33);
    }

    #[tokio::test]
    async fn failed_step_can_be_retried_alone() {
        let dir = tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let flaky = Arc::new(FnStage::new("transcribe", move |_ctx| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StageError::other("model not warmed up"))
                } else {
                    Ok(serde_json::json!({"text": "hello"}))
                }
            }
        }));

        let registry = StageRegistry::new()
            .with(counting_stage("transcode", Arc::new(AtomicUsize::new(0))))
            .with(flaky);
        let engine = Engine::new(
            test_settings(dir.path()),
            Arc::new(JobStore::in_memory()),
            registry,
        );

        let job = engine.create_job(&["transcode", "transcribe"]);
        engine.run_pipeline(&job.id).await.unwrap_err();

        let retried = engine.run_step(&job.id, 1, false).await.unwrap();

        assert_eq!(retried.status, JobStatus::Completed);
        assert_eq!(retried.steps[1].status, StepStatus::Completed);
        assert!(retried.steps[1].error.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_step_enforces_order_and_bounds() {
        let dir = tempdir().unwrap();
        let (engine, _counters) = counting_engine(dir.path());
        let job = engine.create_job(&STEPS);

        let err = engine.run_step(&job.id, 1, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::StepNotReady { .. }));

        let err = engine.run_step(&job.id, 9, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::StepOutOfRange { .. }));

        // A rejected trigger must not poison the job
        assert_eq!(engine.job(&job.id).unwrap().status, JobStatus::Uploaded);
    }

    #[tokio::test]
    async fn completed_step_requires_force_restart() {
        let dir = tempdir().unwrap();
        let (engine, _counters) = counting_engine(dir.path());
        let job = engine.create_job(&STEPS);
        engine.run_pipeline(&job.id).await.unwrap();

        let err = engine.run_step(&job.id, 1, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::StepNotReady { .. }));
    }

    #[tokio::test]
    async fn force_restart_clears_details_before_reexecution() {
        let dir = tempdir().unwrap();
        let saw_clean_slate = Arc::new(AtomicBool::new(false));
        let saw_clean_slate_clone = Arc::clone(&saw_clean_slate);

        let observing = Arc::new(FnStage::new("transcribe", move |ctx| {
            let step = &ctx.job.steps[ctx.step_index];
            let clean = step.details.is_none() && step.error.is_none();
            let flag = Arc::clone(&saw_clean_slate_clone);
            async move {
                flag.store(clean, Ordering::SeqCst);
                Ok(serde_json::json!({"attempt": 2}))
            }
        }));

        let registry = StageRegistry::new()
            .with(counting_stage("transcode", Arc::new(AtomicUsize::new(0))))
            .with(observing);
        let engine = Engine::new(
            test_settings(dir.path()),
            Arc::new(JobStore::in_memory()),
            registry,
        );

        let job = engine.create_job(&["transcode", "transcribe"]);
        engine.run_pipeline(&job.id).await.unwrap();
        assert!(engine.job(&job.id).unwrap().steps[1].details.is_some());

        let done = engine.run_step(&job.id, 1, true).await.unwrap();

        assert!(saw_clean_slate.load(Ordering::SeqCst));
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.steps[1].details.as_ref().unwrap()["attempt"], 2);
    }

    #[tokio::test]
    async fn unknown_stage_is_a_driver_error() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(
            test_settings(dir.path()),
            Arc::new(JobStore::in_memory()),
            StageRegistry::new(),
        );

        let job = engine.create_job(&["transcode"]);
        let err = engine.run_pipeline(&job.id).await.unwrap_err();

        assert!(matches!(err, PipelineError::UnknownStage { .. }));
        let job = engine.job(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("transcode"));
    }

    #[tokio::test]
    async fn concurrent_triggers_share_one_execution() {
        let dir = tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);

        let slow = Arc::new(FnStage::new("transcode", move |_ctx| {
            let runs = Arc::clone(&runs_clone);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(serde_json::json!({"ran": true}))
            }
        }));

        let registry = StageRegistry::new().with(slow);
        let engine = Arc::new(Engine::new(
            test_settings(dir.path()),
            Arc::new(JobStore::in_memory()),
            registry,
        ));

        let job = engine.create_job(&["transcode"]);

        let first = {
            let engine = Arc::clone(&engine);
            let id = job.id.clone();
            tokio::spawn(async move { engine.run_step(&id, 0, false).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let engine = Arc::clone(&engine);
            let id = job.id.clone();
            tokio::spawn(async move { engine.run_step(&id, 0, false).await })
        };

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(a.status, JobStatus::Completed);
        assert_eq!(b.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn missing_job_is_rejected() {
        let dir = tempdir().unwrap();
        let (engine, _counters) = counting_engine(dir.path());

        let err = engine.run_pipeline("no-such-job").await.unwrap_err();
        assert!(matches!(err, PipelineError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn job_error_clears_when_processing_resumes() {
        let dir = tempdir().unwrap();
        let (engine, _counters) = counting_engine(dir.path());
        let job = engine.create_job(&STEPS);

        engine.store().update(&job.id, |job| job.abort("previous driver abort"));

        let done = engine.run_pipeline(&job.id).await.unwrap();
        assert!(done.error.is_none());
        assert_eq!(done.status, JobStatus::Completed);
    }
}
