//! # Error Types
//!
//! - [`JobError`]: why awaiting a job failed. Clonable so every awaiter of the same job
//!   observes the same failure; I/O causes are shared through `Arc`.
//! - [`ExpandError`]: a command template could not be expanded.
//! - [`SettingsError`]: engine settings could not be loaded.
//!
//! Write failures on individual pipe destinations are not represented here. They are
//! logged by the multiplexer and never reach the caller.

use crate::constants::SPAWN_FAILURE_EXIT_CODE;
use crate::output::ProcessOutput;
use std::{io, path::PathBuf, sync::Arc, time::Duration};

/// Failure reported when awaiting a [`ProcessJob`](crate::job::ProcessJob).
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// The process could not be created. Reported with exit code 127.
    #[error("Process could not be started: {command_line}: {source}")]
    SpawnFailure {
        command_line: String,
        #[source]
        source: Arc<io::Error>,
        output: ProcessOutput,
    },

    /// The process ran and exited with a non-zero code.
    #[error("Process '{command}' (pid {}) exited with code {}: {command_line}", .pid.map_or_else(|| "?".to_string(), |p| p.to_string()), .output.exit_code())]
    NonZeroExit {
        command: String,
        command_line: String,
        pid: Option<u32>,
        output: ProcessOutput,
    },

    /// The timeout elapsed and the process was killed. `cause` describes the forced exit.
    #[error("Process reached its timeout of {timeout:?}: {command_line}")]
    TimedOut {
        command_line: String,
        timeout: Duration,
        #[source]
        cause: Box<JobError>,
    },

    /// The job was used in a way its lifecycle does not allow.
    #[error("Invalid job state: {0}")]
    InvalidState(String),
}

impl JobError {
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, JobError::SpawnFailure { .. })
    }

    pub fn is_non_zero_exit(&self) -> bool {
        matches!(self, JobError::NonZeroExit { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, JobError::TimedOut { .. })
    }

    /// Suppressed by no-throw mode. Timeouts and misuse always propagate.
    pub fn is_suppressible(&self) -> bool {
        self.is_spawn_failure() || self.is_non_zero_exit()
    }

    /// Output captured before the failure, if the failure carries one.
    pub fn output(&self) -> Option<&ProcessOutput> {
        match self {
            JobError::SpawnFailure { output, .. } | JobError::NonZeroExit { output, .. } => Some(output),
            JobError::TimedOut { cause, .. } => cause.output(),
            JobError::InvalidState(_) => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            JobError::SpawnFailure { .. } => Some(SPAWN_FAILURE_EXIT_CODE),
            _ => self.output().map(ProcessOutput::exit_code),
        }
    }

    /// Display form of the command that failed.
    pub fn command_line(&self) -> Option<&str> {
        match self {
            JobError::SpawnFailure { command_line, .. }
            | JobError::NonZeroExit { command_line, .. }
            | JobError::TimedOut { command_line, .. } => Some(command_line),
            JobError::InvalidState(_) => None,
        }
    }

    /// Get error category for programmatic handling
    pub fn error_category(&self) -> &'static str {
        match self {
            JobError::SpawnFailure { .. } => "SPAWN",
            JobError::NonZeroExit { .. } => "EXIT",
            JobError::TimedOut { .. } => "TIMEOUT",
            JobError::InvalidState(_) => "STATE",
        }
    }
}

/// Errors raised while expanding a command template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpandError {
    #[error("Template has {placeholders} placeholder(s) but {values} value(s) were supplied")]
    CountMismatch { placeholders: usize, values: usize },

    #[error("Unbalanced '{brace}' at byte {position} in template: {template}")]
    UnbalancedBrace {
        template: String,
        brace: char,
        position: usize,
    },
}

/// Errors raised while loading engine settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for {field}: '{value}'")]
    InvalidValue { field: &'static str, value: String },
}
