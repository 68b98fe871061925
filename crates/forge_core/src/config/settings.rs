//! Settings struct with TOML-based sections.
//!
//! Settings are organized into logical sections that map to TOML tables.
//! Each section can be updated independently for atomic section-level updates.

use serde::{Deserialize, Serialize};

use crate::logging::{LogConfig, LogLevel};

/// Root settings structure containing all configuration sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Path-related settings.
    #[serde(default)]
    pub paths: PathSettings,

    /// Engine behavior settings.
    #[serde(default)]
    pub engine: EngineSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Path configuration for state, work, output, and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Job table state file.
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Root folder for per-job working directories.
    #[serde(default = "default_work_root")]
    pub work_root: String,

    /// Output folder for finished media.
    #[serde(default = "default_output_folder")]
    pub output_folder: String,

    /// Folder for per-job log files.
    #[serde(default = "default_logs_folder")]
    pub logs_folder: String,
}

fn default_state_file() -> String {
    "jobs.json".to_string()
}

fn default_work_root() -> String {
    ".work".to_string()
}

fn default_output_folder() -> String {
    "forge_output".to_string()
}

fn default_logs_folder() -> String {
    ".logs".to_string()
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            work_root: default_work_root(),
            output_folder: default_output_folder(),
            logs_folder: default_logs_folder(),
        }
    }
}

/// Engine behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Seconds the recovery scanner waits after startup before inspecting
    /// locks, so freshly-triggered executions can register first.
    #[serde(default = "default_recovery_grace_secs")]
    pub recovery_grace_secs: u64,

    /// Probe the OS process table before resuming an interrupted job.
    /// Disable only when an embedder supplies its own liveness probe.
    #[serde(default = "default_true")]
    pub probe_processes: bool,
}

fn default_recovery_grace_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            recovery_grace_secs: default_recovery_grace_secs(),
            probe_processes: default_true(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Minimum level for per-job log files.
    #[serde(default)]
    pub level: LogLevel,

    /// Use compact log format.
    #[serde(default = "default_true")]
    pub compact: bool,

    /// Number of external-tool output lines to keep for error tails.
    #[serde(default = "default_error_tail")]
    pub error_tail: u32,

    /// Progress update step percentage.
    #[serde(default = "default_progress_step")]
    pub progress_step: u32,

    /// Show timestamps in per-job logs.
    #[serde(default = "default_true")]
    pub show_timestamps: bool,
}

fn default_error_tail() -> u32 {
    20
}

fn default_progress_step() -> u32 {
    20
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            compact: default_true(),
            error_tail: default_error_tail(),
            progress_step: default_progress_step(),
            show_timestamps: default_true(),
        }
    }
}

impl LoggingSettings {
    /// Build a per-job `LogConfig` from these settings.
    pub fn to_log_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            compact: self.compact,
            progress_step: self.progress_step,
            error_tail: self.error_tail as usize,
            show_timestamps: self.show_timestamps,
        }
    }
}

/// Identifies a config section for section-level updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    Paths,
    Engine,
    Logging,
}

impl ConfigSection {
    /// TOML table name for this section.
    pub fn table_name(&self) -> &'static str {
        match self {
            ConfigSection::Paths => "paths",
            ConfigSection::Engine => "engine",
            ConfigSection::Logging => "logging",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let settings = Settings::default();
        assert_eq!(settings.paths.state_file, "jobs.json");
        assert_eq!(settings.engine.recovery_grace_secs, 5);
        assert!(settings.logging.compact);
    }

    #[test]
    fn partial_toml_applies_defaults() {
        let settings: Settings =
            toml::from_str("[paths]\nstate_file = \"custom.json\"\n").unwrap();
        assert_eq!(settings.paths.state_file, "custom.json");
        assert_eq!(settings.paths.output_folder, "forge_output");
        assert_eq!(settings.engine.recovery_grace_secs, 5);
    }

    #[test]
    fn log_config_conversion() {
        let mut settings = LoggingSettings::default();
        settings.error_tail = 7;
        settings.compact = false;

        let config = settings.to_log_config();
        assert_eq!(config.error_tail, 7);
        assert!(!config.compact);
    }
}
