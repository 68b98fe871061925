//! Job table with whole-table persistence.
//!
//! The in-memory map is the source of truth; `save()` rewrites the entire
//! table to the state file after each logical unit of mutation. Loading
//! treats a missing or unparseable file as an empty table, so a corrupt
//! state file degrades to "nothing persisted yet" instead of an error.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::models::Job;

/// Persistent state envelope (saved to the jobs state file).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreState {
    /// State file format version.
    version: u32,
    /// Full job table keyed by job id.
    jobs: HashMap<String, Job>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            version: 1,
            jobs: HashMap::new(),
        }
    }
}

/// In-memory job table with persistence to a single state file.
#[derive(Debug)]
pub struct JobStore {
    /// Full job table.
    jobs: RwLock<HashMap<String, Job>>,
    /// Path to the state file for persistence.
    state_file: PathBuf,
    /// Serializes whole-table writes; the file is rewritten in full on
    /// every save, so concurrent savers must not interleave.
    save_lock: Mutex<()>,
}

impl JobStore {
    /// Create a store persisting to the given state file, loading any
    /// previously saved table.
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        let state_file = state_file.into();

        let jobs = if state_file.exists() {
            match fs::read_to_string(&state_file) {
                Ok(content) => match serde_json::from_str::<StoreState>(&content) {
                    Ok(state) => {
                        tracing::info!(
                            "Loaded {} jobs from {}",
                            state.jobs.len(),
                            state_file.display()
                        );
                        state.jobs
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", state_file.display(), e);
                        HashMap::new()
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", state_file.display(), e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Self {
            jobs: RwLock::new(jobs),
            state_file,
            save_lock: Mutex::new(()),
        }
    }

    /// Create a store without persistence (for testing).
    pub fn in_memory() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            state_file: PathBuf::new(),
            save_lock: Mutex::new(()),
        }
    }

    /// Path to the state file.
    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Get a snapshot of a job by id.
    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().get(id).cloned()
    }

    /// Insert or replace a job. Does not imply `save`; callers persist
    /// after a logical unit of mutation.
    pub fn set(&self, job: Job) {
        self.jobs.write().insert(job.id.clone(), job);
    }

    /// Mutate a job in place, returning a snapshot of the updated record.
    /// Returns `None` if the job does not exist.
    pub fn update<F>(&self, id: &str, mutate: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(id)?;
        mutate(job);
        Some(job.clone())
    }

    /// Snapshot of all jobs (unordered).
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.read().values().cloned().collect()
    }

    /// Number of jobs in the table.
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Persist the full table to the state file.
    ///
    /// Writes atomically via a temp file in the same directory, then
    /// renames over the state file.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if self.state_file.as_os_str().is_empty() {
            return Ok(()); // In-memory store, nothing to save
        }

        let _guard = self.save_lock.lock();

        let state = StoreState {
            version: 1,
            jobs: self.jobs.read().clone(),
        };

        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let temp_file = self.state_file.with_extension("json.tmp");
        fs::write(&temp_file, &json)?;
        fs::rename(&temp_file, &self.state_file)?;

        tracing::debug!(
            "Saved {} jobs to {}",
            state.jobs.len(),
            self.state_file.display()
        );
        Ok(())
    }

    /// Persist, logging any failure instead of surfacing it.
    ///
    /// The engine favors availability of the in-memory state over strict
    /// durability: a failed write loses at most the latest transition,
    /// which the recovery scanner tolerates on the next start.
    pub fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::warn!("Failed to persist job table: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, StepStatus};
    use tempfile::tempdir;

    fn make_job(id: &str) -> Job {
        Job::new(id, &["transcode", "transcribe"])
    }

    #[test]
    fn set_and_get_round_trip() {
        let store = JobStore::in_memory();
        store.set(make_job("a"));
        store.set(make_job("b"));

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a").unwrap().id, "a");
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn update_mutates_in_place() {
        let store = JobStore::in_memory();
        store.set(make_job("a"));

        let updated = store
            .update("a", |job| {
                job.steps[0].begin();
                job.begin();
            })
            .unwrap();

        assert_eq!(updated.status, JobStatus::Processing);
        assert_eq!(store.get("a").unwrap().steps[0].status, StepStatus::Processing);
        assert!(store.update("missing", |_| {}).is_none());
    }

    #[test]
    fn save_and_reload_preserves_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let store = JobStore::new(&path);
        let mut job = make_job("persisted");
        job.steps[0].complete(serde_json::json!({"artifact": "a.wav"}));
        job.refresh_progress();
        store.set(job);
        store.save().unwrap();

        let reloaded = JobStore::new(&path);
        let job = reloaded.get("persisted").unwrap();
        assert_eq!(job.steps[0].status, StepStatus::Completed);
        assert_eq!(job.progress, 50);
    }

    #[test]
    fn corrupt_state_file_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        fs::write(&path, "{ not json").unwrap();

        let store = JobStore::new(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let store = JobStore::new(&path);
        store.set(make_job("a"));
        store.save().unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
