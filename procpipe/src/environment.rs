//! # Process-wide Environment
//!
//! Defaults shared by every job created without explicit options: the shell dialect, the
//! console, verbosity and the timing windows. The current environment is an `Arc`
//! snapshot; replacing it affects jobs created afterwards, never jobs already running.
//!
//! ```rust,no_run
//! use procpipe::{environment::Environment, shell::ShellExecutor};
//!
//! Environment::set_current(Environment::default().with_shell(ShellExecutor::no_shell()));
//! ```

use crate::console::{ConsoleProvider, SystemConsole};
use crate::constants::{DEFAULT_PIPE_GRACE, DEFAULT_START_DELAY};
use crate::error::SettingsError;
use crate::job::Verbosity;
use crate::settings::EngineSettings;
use crate::shell::ShellExecutor;
use std::{
    fmt,
    sync::{Arc, LazyLock, RwLock},
    time::Duration,
};

static CURRENT: LazyLock<RwLock<Arc<Environment>>> =
    LazyLock::new(|| RwLock::new(Arc::new(Environment::default())));

/// Defaults for newly created jobs.
#[derive(Clone)]
pub struct Environment {
    pub verbosity: Verbosity,
    pub shell: ShellExecutor,
    pub console: Arc<dyn ConsoleProvider>,
    /// `Duration::ZERO` means no timeout.
    pub process_timeout: Duration,
    pub start_delay: Duration,
    pub pipe_grace: Duration,
}

impl Environment {
    /// The environment new jobs pick up.
    pub fn current() -> Arc<Environment> {
        Arc::clone(&CURRENT.read().expect("environment lock poisoned"))
    }

    /// Replaces the current environment and returns the previous one.
    pub fn set_current(environment: Environment) -> Arc<Environment> {
        let mut current = CURRENT.write().expect("environment lock poisoned");
        std::mem::replace(&mut *current, Arc::new(environment))
    }

    /// Builds an environment from settings, using the system console.
    pub fn from_settings(settings: &EngineSettings) -> Result<Environment, SettingsError> {
        Ok(Environment {
            verbosity: settings.verbosity()?,
            shell: settings.shell_executor(),
            console: SystemConsole::shared(),
            process_timeout: settings.timeout(),
            start_delay: settings.start_delay(),
            pipe_grace: settings.pipe_grace(),
        })
    }

    pub fn with_shell(mut self, shell: ShellExecutor) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_console(mut self, console: Arc<dyn ConsoleProvider>) -> Self {
        self.console = console;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_pipe_grace(mut self, grace: Duration) -> Self {
        self.pipe_grace = grace;
        self
    }

    /// Switches the current environment to the platform's preferred shell.
    pub fn use_default_shell() {
        Self::update_shell(ShellExecutor::platform_default());
    }

    /// Switches the current environment to `bash` with the given script prefix.
    pub fn use_bash(prefix: &str) {
        Self::update_shell(ShellExecutor::posix(None, prefix));
    }

    pub fn use_cmd() {
        Self::update_shell(ShellExecutor::cmd());
    }

    /// Switches the current environment to direct execution.
    pub fn no_use_shell() {
        Self::update_shell(ShellExecutor::no_shell());
    }

    fn update_shell(shell: ShellExecutor) {
        let mut current = CURRENT.write().expect("environment lock poisoned");
        let updated = current.as_ref().clone().with_shell(shell);
        *current = Arc::new(updated);
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::FULL,
            shell: ShellExecutor::platform_default(),
            console: SystemConsole::shared(),
            process_timeout: Duration::ZERO,
            start_delay: DEFAULT_START_DELAY,
            pipe_grace: DEFAULT_PIPE_GRACE,
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("verbosity", &self.verbosity)
            .field("shell", &self.shell)
            .field("process_timeout", &self.process_timeout)
            .field("start_delay", &self.start_delay)
            .field("pipe_grace", &self.pipe_grace)
            .finish_non_exhaustive()
    }
}
