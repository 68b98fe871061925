//! Liveness probe for external worker processes.
//!
//! The recovery scanner must not resume a job whose external engine
//! survived the parent's restart. Stage commands carry the job id in
//! their argv (see `CommandStage`), so a process-table scan for the id
//! is the liveness heuristic. It is deliberately pluggable: the scan can
//! both miss a live process using a different invocation signature and
//! match an unrelated process, so embedders with stricter needs can
//! substitute their own probe.

use sysinfo::System;

/// Capability to answer "is any external process for this job alive?".
pub trait ProcessProbe: Send + Sync {
    /// Whether any process tagged with the given job id is running.
    fn is_alive(&self, job_id: &str) -> bool;
}

/// Probe backed by an OS process-table scan.
///
/// A process counts as alive for a job when any of its command-line
/// arguments contains the job id.
#[derive(Debug, Default)]
pub struct SystemProcessProbe;

impl SystemProcessProbe {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessProbe for SystemProcessProbe {
    fn is_alive(&self, job_id: &str) -> bool {
        if job_id.is_empty() {
            return false;
        }

        let mut system = System::new();
        system.refresh_processes();

        for process in system.processes().values() {
            if process.cmd().iter().any(|arg| arg.contains(job_id)) {
                tracing::debug!(
                    "Found live process {} for job {}",
                    process.pid(),
                    job_id
                );
                return true;
            }
        }

        false
    }
}

/// Probe that reports nothing alive. Used in tests and by embedders that
/// manage external processes themselves.
#[derive(Debug, Default)]
pub struct NullProbe;

impl ProcessProbe for NullProbe {
    fn is_alive(&self, _job_id: &str) -> bool {
        false
    }
}
