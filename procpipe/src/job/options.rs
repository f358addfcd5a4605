//! Job Options and Verbosity
//!
//! [`JobOptions`] carries every per-job setting. Defaults come from the process-wide
//! [`Environment`](crate::environment::Environment), and each field has a `with_*`
//! builder that returns a modified copy:
//!
//! ```rust
//! use procpipe::job::{JobOptions, Verbosity};
//! use std::time::Duration;
//!
//! let options = JobOptions::default()
//!     .with_verbosity(Verbosity::SILENT)
//!     .with_timeout(Duration::from_secs(30));
//! assert_eq!(options.effective_timeout(), Some(Duration::from_secs(30)));
//! ```

use crate::console::ConsoleProvider;
use crate::environment::Environment;
use crate::shell::ShellExecutor;
use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

/// What a job echoes to its console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Verbosity(u8);

impl Verbosity {
    /// Nothing is echoed.
    pub const SILENT: Verbosity = Verbosity(0);
    /// The command line is printed (`$ cmd`) before the process starts.
    pub const COMMAND_LINE: Verbosity = Verbosity(1);
    /// Process stdout/stderr are forwarded to the console.
    pub const CONSOLE_OUTPUTS: Verbosity = Verbosity(2);
    pub const FULL: Verbosity = Verbosity(1 | 2);
    /// Lifecycle traces are echoed as `[DEBUG][id] ...` lines.
    pub const DEBUG: Verbosity = Verbosity(0x80);

    pub fn contains(self, other: Verbosity) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Verbosity {
    type Output = Verbosity;

    fn bitor(self, rhs: Verbosity) -> Verbosity {
        Verbosity(self.0 | rhs.0)
    }
}

impl BitOrAssign for Verbosity {
    fn bitor_assign(&mut self, rhs: Verbosity) {
        self.0 |= rhs.0;
    }
}

impl FromStr for Verbosity {
    type Err = String;

    /// Parses one flag name, or several joined with `,` or `|`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split([',', '|'])
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .try_fold(Verbosity::SILENT, |acc, name| {
                let flag = match name.to_ascii_lowercase().replace('_', "-").as_str() {
                    "silent" => Verbosity::SILENT,
                    "command-line" | "commandline" => Verbosity::COMMAND_LINE,
                    "console-outputs" | "consoleoutputs" | "outputs" => Verbosity::CONSOLE_OUTPUTS,
                    "full" => Verbosity::FULL,
                    "debug" => Verbosity::FULL | Verbosity::DEBUG,
                    _ => return Err(format!("unknown verbosity flag '{name}'")),
                };
                Ok(acc | flag)
            })
    }
}

/// Per-job configuration.
#[derive(Clone)]
pub struct JobOptions {
    /// Open a stdin pipe to the process and start it without the deferred delay.
    pub redirect_standard_input: bool,
    /// Forward the console's redirected stdin when no other input is configured.
    pub enable_auto_wire_standard_input: bool,
    pub shell: ShellExecutor,
    pub console: Arc<dyn ConsoleProvider>,
    pub verbosity: Verbosity,
    pub working_directory: Option<PathBuf>,
    /// `Duration::ZERO` or `Duration::MAX` means no timeout.
    pub timeout: Duration,
    /// How long an unwired job waits before starting on its own.
    pub start_delay: Duration,
    /// Grace period for draining the output pipes after exit.
    pub pipe_grace: Duration,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_environment(environment: &Environment) -> Self {
        Self {
            redirect_standard_input: false,
            enable_auto_wire_standard_input: true,
            shell: environment.shell.clone(),
            console: Arc::clone(&environment.console),
            verbosity: environment.verbosity,
            working_directory: None,
            timeout: environment.process_timeout,
            start_delay: environment.start_delay,
            pipe_grace: environment.pipe_grace,
        }
    }

    pub fn with_redirect_standard_input(mut self, redirect: bool) -> Self {
        self.redirect_standard_input = redirect;
        self
    }

    pub fn with_auto_wire_standard_input(mut self, enable: bool) -> Self {
        self.enable_auto_wire_standard_input = enable;
        self
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

    pub fn with_working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
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

    /// The timeout to arm, or `None` when the job may run forever.
    pub fn effective_timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero() && self.timeout != Duration::MAX).then_some(self.timeout)
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from_environment(&Environment::current())
    }
}

impl fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("redirect_standard_input", &self.redirect_standard_input)
            .field("enable_auto_wire_standard_input", &self.enable_auto_wire_standard_input)
            .field("shell", &self.shell)
            .field("verbosity", &self.verbosity)
            .field("working_directory", &self.working_directory)
            .field("timeout", &self.timeout)
            .field("start_delay", &self.start_delay)
            .field("pipe_grace", &self.pipe_grace)
            .finish_non_exhaustive()
    }
}
