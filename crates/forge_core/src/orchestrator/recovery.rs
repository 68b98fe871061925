//! Startup crash-recovery scanner.
//!
//! After a process restart, jobs recorded as `processing` were left
//! mid-flight by the previous instance. The scanner resumes them unless
//! the work is demonstrably still running: the (job, step) key is held in
//! the lock manager (a fresh trigger beat the scanner to it), or the
//! process probe finds a live external process tagged with the job id
//! (the engine survived the parent's restart). The probe is a heuristic,
//! so the policy errs toward not resuming.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::Settings;

use super::engine::Engine;
use super::locks::LockKey;

/// Outcome of one recovery scan.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Jobs resumed to completion.
    pub resumed: Vec<String>,
    /// Jobs skipped because their step was already executing in-process.
    pub skipped_locked: Vec<String>,
    /// Jobs skipped because an external process for them is still alive.
    pub skipped_live: Vec<String>,
    /// Jobs whose resume failed, with the failure message.
    pub failed: Vec<(String, String)>,
}

impl RecoveryReport {
    /// Total number of interrupted jobs the scan looked at.
    pub fn total(&self) -> usize {
        self.resumed.len() + self.skipped_locked.len() + self.skipped_live.len() + self.failed.len()
    }

    /// Check if the scan found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// One-shot scanner for jobs left mid-flight by a previous process.
pub struct RecoveryScanner {
    /// Delay before inspecting locks, so freshly-spawned executions have
    /// a chance to register first.
    grace: Duration,
    /// Set once the scan has run; later calls are no-ops.
    completed: AtomicBool,
}

impl RecoveryScanner {
    /// Create a scanner with the given grace delay.
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            completed: AtomicBool::new(false),
        }
    }

    /// Create a scanner configured from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(Duration::from_secs(settings.engine.recovery_grace_secs))
    }

    /// Scan the job table and resume interrupted jobs.
    ///
    /// Runs at most once per scanner lifetime; repeat calls return an
    /// empty report. Resume is best-effort: a failed resume marks the job
    /// `failed` with the resume error and the scan moves on.
    pub async fn scan(&self, engine: &Engine) -> RecoveryReport {
        if self.completed.swap(true, Ordering::SeqCst) {
            tracing::warn!("Recovery scan already ran in this process, skipping");
            return RecoveryReport::default();
        }

        tokio::time::sleep(self.grace).await;

        let mut report = RecoveryReport::default();

        for job in engine.jobs() {
            if !job.is_interrupted() {
                continue;
            }

            let resume_index = job.resume_index();
            let key = LockKey::new(&job.id, resume_index);

            if engine.lock_manager().is_held(&key) {
                tracing::info!(
                    "Job {} step {} already executing, skipping resume",
                    job.id,
                    resume_index
                );
                report.skipped_locked.push(job.id);
                continue;
            }

            if engine.probe().is_alive(&job.id) {
                tracing::warn!(
                    "External process for job {} still running, not resuming",
                    job.id
                );
                report.skipped_live.push(job.id);
                continue;
            }

            tracing::info!("Resuming interrupted job {}", job.id);
            match engine.run_pipeline(&job.id).await {
                Ok(_) => report.resumed.push(job.id),
                Err(err) => {
                    // A failed resume is terminal, even when the failure
                    // came from a stage: interactive retries keep a job
                    // pending, the startup scan does not.
                    if err.is_stage_failure() {
                        engine.store().update(&job.id, |job| {
                            job.abort(format!("Resume failed: {}", err));
                        });
                        engine.store().persist();
                    }
                    report.failed.push((job.id, err.to_string()));
                }
            }
        }

        if !report.is_empty() {
            tracing::info!(
                "Recovery scan: {} resumed, {} skipped (locked), {} skipped (live), {} failed",
                report.resumed.len(),
                report.skipped_locked.len(),
                report.skipped_live.len(),
                report.failed.len()
            );
        }

        report
    }
}
