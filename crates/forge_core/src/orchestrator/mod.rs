//! Job/step orchestration engine.
//!
//! This module coordinates multi-step media-processing jobs over
//! external engines. Each job is an ordered sequence of named steps; the
//! engine persists every transition, deduplicates concurrent triggers,
//! and resumes interrupted work after a restart.
//!
//! # Architecture
//!
//! ```text
//! Engine
//!     ├── JobStore          durable job table (load on start, save through)
//!     ├── StageRegistry     stage name -> StageOperation
//!     ├── LockManager       (job, step) -> in-flight execution
//!     └── RecoveryScanner   one-shot startup resume
//! ```
//!
//! # Example
//!
//! ```ignore
//! use forge_core::orchestrator::{Engine, FallbackChain, StageRegistry};
//! use forge_core::orchestrator::stages::CommandStage;
//!
//! let registry = StageRegistry::new()
//!     .with(Arc::new(
//!         FallbackChain::new("transcode")
//!             .with_strategy(Arc::new(chunked_transcode))
//!             .with_strategy(Arc::new(single_pass_transcode)),
//!     ))
//!     .with(Arc::new(
//!         CommandStage::new("transcribe", "stt-engine")
//!             .args(["--job", "{job_id}", "--input", "{work_dir}/audio.wav"]),
//!     ));
//!
//! let engine = Engine::new(settings, store, registry);
//! let job = engine.create_job(&["transcode", "transcribe"]);
//! engine.run_pipeline(&job.id).await?;
//! ```

mod engine;
mod errors;
mod fallback;
mod locks;
mod recovery;
mod stage;
pub mod stages;

pub use engine::Engine;
pub use errors::{PipelineError, PipelineResult, StageError, StageResult};
pub use fallback::FallbackChain;
pub use locks::{LockKey, LockManager};
pub use recovery::{RecoveryReport, RecoveryScanner};
pub use stage::{StageContext, StageOperation, StageRegistry};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::config::Settings;
    use crate::logging::{JobLogger, LogConfig};
    use crate::models::Job;

    use super::stage::StageContext;

    /// Build a stage context rooted in a temp directory.
    ///
    /// Returns the directory handle alongside the context; dropping it
    /// deletes the tree, so tests keep it alive for their duration.
    pub fn stage_context(job_id: &str, step_names: &[&str]) -> (StageContext, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("work");
        let output_dir = dir.path().join("out");
        std::fs::create_dir_all(&work_dir).unwrap();
        std::fs::create_dir_all(&output_dir).unwrap();

        let logger = JobLogger::new(
            job_id,
            dir.path().join("logs"),
            LogConfig::default(),
            None,
        )
        .unwrap();

        let ctx = StageContext {
            job: Job::new(job_id, step_names),
            step_index: 0,
            settings: Settings::default(),
            work_dir,
            output_dir,
            logger: Arc::new(logger),
        };

        (ctx, dir)
    }
}
