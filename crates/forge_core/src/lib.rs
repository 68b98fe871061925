//! Forge Core - Backend logic for MediaForge
//!
//! This crate contains the job/step orchestration engine with zero UI
//! dependencies: durable job state, per-step execution locking, fallback
//! escalation, and startup crash recovery. It can be used by an HTTP
//! trigger layer, a GUI application, or a CLI tool.

pub mod config;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod process;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_returns_value() {
        assert!(!version().is_empty());
    }
}
