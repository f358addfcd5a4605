//! # Engine Settings
//!
//! File-based configuration for the process-wide defaults. Settings are TOML; every field
//! is optional and falls back to the built-in default:
//!
//! ```toml
//! verbosity = ["command-line", "outputs"]
//! shell = "bash"              # auto | bash | cmd | none
//! shell_path = "/usr/local/bin/bash"
//! shell_prefix = "set -eu;"
//! timeout_ms = 30000          # 0 = no timeout
//! start_delay_ms = 250
//! pipe_grace_ms = 1000
//! ```
//!
//! `apply_env_overrides` then lets `PROCPIPE_SHELL`, `PROCPIPE_TIMEOUT_MS` and
//! `PROCPIPE_VERBOSITY` override whatever the file said.

use crate::constants::{DEFAULT_PIPE_GRACE, DEFAULT_POSIX_PREFIX, DEFAULT_START_DELAY, ENV_PREFIX};
use crate::error::SettingsError;
use crate::job::Verbosity;
use crate::shell::{ShellExecutor, detected_bash};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

/// Which shell dialect new jobs use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellChoice {
    /// `cmd` on Windows, `bash` when available, otherwise direct execution.
    #[default]
    Auto,
    Bash,
    Cmd,
    None,
}

impl FromStr for ShellChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ShellChoice::Auto),
            "bash" | "posix" => Ok(ShellChoice::Bash),
            "cmd" => Ok(ShellChoice::Cmd),
            "none" | "no-shell" => Ok(ShellChoice::None),
            other => Err(format!("unknown shell '{other}'")),
        }
    }
}

impl fmt::Display for ShellChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShellChoice::Auto => "auto",
            ShellChoice::Bash => "bash",
            ShellChoice::Cmd => "cmd",
            ShellChoice::None => "none",
        })
    }
}

/// Process-wide engine configuration as read from a settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Verbosity flag names; an empty list means `full`.
    pub verbosity: Vec<String>,
    pub shell: ShellChoice,
    /// Explicit shell binary for the `bash` dialect.
    pub shell_path: Option<PathBuf>,
    pub shell_prefix: String,
    pub timeout_ms: u64,
    pub start_delay_ms: u64,
    pub pipe_grace_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            verbosity: Vec::new(),
            shell: ShellChoice::Auto,
            shell_path: None,
            shell_prefix: DEFAULT_POSIX_PREFIX.to_string(),
            timeout_ms: 0,
            start_delay_ms: DEFAULT_START_DELAY.as_millis() as u64,
            pipe_grace_ms: DEFAULT_PIPE_GRACE.as_millis() as u64,
        }
    }
}

impl EngineSettings {
    pub fn from_toml_str(contents: &str) -> Result<Self, SettingsError> {
        let settings: EngineSettings = toml::from_str(contents)?;
        settings.verbosity()?;
        Ok(settings)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Applies `PROCPIPE_*` environment variables on top of the loaded values.
    pub fn apply_env_overrides(&mut self) -> Result<(), SettingsError> {
        self.apply_overrides(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), SettingsError> {
        if let Some(shell) = lookup("SHELL") {
            self.shell = shell.parse().map_err(|_| SettingsError::InvalidValue {
                field: "PROCPIPE_SHELL",
                value: shell,
            })?;
        }
        if let Some(timeout) = lookup("TIMEOUT_MS") {
            self.timeout_ms = timeout.trim().parse().map_err(|_| SettingsError::InvalidValue {
                field: "PROCPIPE_TIMEOUT_MS",
                value: timeout,
            })?;
        }
        if let Some(verbosity) = lookup("VERBOSITY") {
            verbosity
                .parse::<Verbosity>()
                .map_err(|_| SettingsError::InvalidValue {
                    field: "PROCPIPE_VERBOSITY",
                    value: verbosity.clone(),
                })?;
            self.verbosity = vec![verbosity];
        }
        Ok(())
    }

    /// The combined verbosity flags.
    pub fn verbosity(&self) -> Result<Verbosity, SettingsError> {
        if self.verbosity.is_empty() {
            return Ok(Verbosity::FULL);
        }
        self.verbosity.iter().try_fold(Verbosity::SILENT, |acc, name| {
            let flag = name.parse::<Verbosity>().map_err(|_| SettingsError::InvalidValue {
                field: "verbosity",
                value: name.clone(),
            })?;
            Ok(acc | flag)
        })
    }

    /// The shell executor these settings select.
    pub fn shell_executor(&self) -> ShellExecutor {
        match self.shell {
            ShellChoice::Auto if cfg!(windows) => ShellExecutor::cmd(),
            ShellChoice::Auto if self.shell_path.is_none() && detected_bash().is_none() => {
                ShellExecutor::no_shell()
            }
            ShellChoice::Auto | ShellChoice::Bash => {
                ShellExecutor::posix(self.shell_path.clone(), self.shell_prefix.clone())
            }
            ShellChoice::Cmd => ShellExecutor::cmd(),
            ShellChoice::None => ShellExecutor::no_shell(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn pipe_grace(&self) -> Duration {
        Duration::from_millis(self.pipe_grace_ms)
    }
}
