//! Execution lock manager.
//!
//! Deduplicates concurrent invocations of the same (job, step) pair. A
//! "check status, then start" sequence is racy under duplicate triggers
//! (a double-click, a retried network call): the status write and the
//! spawn are not atomic. The lock map closes the race by making "is this
//! key already running" a single synchronized check-and-register.
//!
//! The registered computation is wrapped in a shared future: the first
//! caller registers and drives it, later callers join and receive the
//! same outcome. The key is released when the computation resolves,
//! success or failure alike.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use super::errors::StageResult;

/// Key identifying one step execution: (job id, step index).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub job_id: String,
    pub step_index: usize,
}

impl LockKey {
    pub fn new(job_id: impl Into<String>, step_index: usize) -> Self {
        Self {
            job_id: job_id.into(),
            step_index,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job_id, self.step_index)
    }
}

type SharedExecution = Shared<BoxFuture<'static, StageResult<serde_json::Value>>>;

/// Keyed execution registry.
///
/// At most one execution is in flight per key within the process; the
/// step status field alone cannot guarantee that because it can be stale
/// across restarts.
#[derive(Default)]
pub struct LockManager {
    active: Arc<Mutex<HashMap<LockKey, SharedExecution>>>,
}

impl LockManager {
    /// Create an empty lock manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` under the key, or join the execution already registered
    /// for it.
    ///
    /// If no execution holds the key, `work` is registered and driven to
    /// completion, and the key is released afterwards regardless of
    /// outcome. If an execution is in flight, `work` is dropped unused and
    /// the caller awaits the existing execution's result instead.
    pub async fn acquire_or_join<F>(&self, key: LockKey, work: F) -> StageResult<serde_json::Value>
    where
        F: Future<Output = StageResult<serde_json::Value>> + Send + 'static,
    {
        let execution = {
            let mut active = self.active.lock();
            if let Some(existing) = active.get(&key) {
                tracing::debug!("Joining in-flight execution for {}", key);
                existing.clone()
            } else {
                let registry = Arc::clone(&self.active);
                let release_key = key.clone();
                let execution: SharedExecution = async move {
                    let result = work.await;
                    // Release is unconditional: a failed attempt frees the
                    // key for the next trigger.
                    registry.lock().remove(&release_key);
                    result
                }
                .boxed()
                .shared();
                active.insert(key, execution.clone());
                execution
            }
        };

        execution.await
    }

    /// Whether an execution currently holds the key.
    pub fn is_held(&self, key: &LockKey) -> bool {
        self.active.lock().contains_key(key)
    }

    /// Snapshot of currently-held keys, sorted for stable output.
    pub fn active_keys(&self) -> Vec<LockKey> {
        let mut keys: Vec<LockKey> = self.active.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of in-flight executions.
    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    /// Check if no execution is in flight.
    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}
