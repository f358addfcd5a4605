//! # Shell Dialects
//!
//! A [`ShellExecutor`] decides how a logical command line reaches the operating system:
//! either executed directly (the first token is the program) or handed to a host shell.
//! It also knows how to escape a single argument so that, after the chosen shell (or the
//! direct-exec parser in [`cmdline`]) has consumed it, the program sees the original value.
//!
//! The dialects form a closed set:
//!
//! - [`ShellDialect::NoShell`]: direct exec using the quoting format of [`cmdline`].
//! - [`ShellDialect::Posix`]: `bash -c "<prefix><line>"`, arguments in ANSI-C quoting.
//! - [`ShellDialect::Cmd`]: `cmd /c "<line>"`, arguments caret-escaped in double quotes.

pub mod cmdline;

pub use cmdline::ParseError;

use crate::constants::DEFAULT_POSIX_PREFIX;
use encoding_rs::{Encoding, UTF_8};
use regex::{Captures, Regex};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{LazyLock, OnceLock},
};

static POSIX_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-/]+$").expect("valid posix bare pattern"));
static CMD_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-/\\:]+$").expect("valid cmd bare pattern"));
static CMD_METACHAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[<>|&^]").expect("valid cmd metachar pattern"));
static CMD_QUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\\)?""#).expect("valid cmd quote pattern"));

/// Location of `bash` on the search path, looked up once per process.
pub fn detected_bash() -> Option<&'static Path> {
    static BASH: OnceLock<Option<PathBuf>> = OnceLock::new();
    BASH.get_or_init(|| {
        let found = which::which("bash").ok();
        tracing::debug!("bash lookup on PATH: {:?}", found);
        found
    })
    .as_deref()
}

/// The shell a command line is handed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellDialect {
    NoShell,
    Posix {
        /// Explicit shell binary; `None` means the `bash` found on `PATH`.
        path: Option<PathBuf>,
        /// Script prepended to every command line.
        prefix: String,
    },
    Cmd {
        path: PathBuf,
    },
}

/// Program plus arguments ready to be spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    arguments: String,
    argv: Vec<String>,
    #[cfg_attr(not(windows), allow(dead_code))]
    verbatim: bool,
}

impl Invocation {
    /// Builds an invocation from a program and an argument string in the direct-exec format.
    pub fn from_raw(program: impl Into<String>, arguments: impl Into<String>) -> Result<Self, ParseError> {
        let arguments = arguments.into();
        let argv = cmdline::split_arguments(&arguments)?;
        Ok(Self {
            program: program.into(),
            arguments,
            argv,
            verbatim: false,
        })
    }

    /// Builds an invocation from an already split argument vector.
    pub fn from_argv<I, S>(program: impl Into<String>, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        let arguments = argv
            .iter()
            .map(|arg| cmdline::quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            program: program.into(),
            arguments,
            argv,
            verbatim: false,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument string as it is displayed (and, for `cmd`, passed verbatim on Windows).
    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Creates the `tokio` command for this invocation. Stdio is left for the caller.
    pub(crate) fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        #[cfg(windows)]
        if self.verbatim {
            command.raw_arg(&self.arguments);
            return command;
        }
        command.args(&self.argv);
        command
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.arguments.is_empty() {
            f.write_str(&self.program)
        } else {
            write!(f, "{} {}", self.program, self.arguments)
        }
    }
}

/// Errors raised while turning a command line into an [`Invocation`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShellError {
    #[error("bash is not found on the PATH")]
    ShellNotFound,

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Immutable strategy describing one shell dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellExecutor {
    dialect: ShellDialect,
    encoding: &'static Encoding,
}

impl ShellExecutor {
    /// Direct execution without any host shell.
    pub fn no_shell() -> Self {
        Self::from_dialect(ShellDialect::NoShell)
    }

    /// `bash` from `PATH` with the default `set -euo pipefail;` prefix.
    pub fn bash() -> Self {
        Self::posix(None, DEFAULT_POSIX_PREFIX)
    }

    /// A POSIX shell at `path` (or `bash` from `PATH`) with a custom script prefix.
    pub fn posix(path: Option<PathBuf>, prefix: impl Into<String>) -> Self {
        Self::from_dialect(ShellDialect::Posix {
            path,
            prefix: prefix.into(),
        })
    }

    /// The Windows command interpreter.
    pub fn cmd() -> Self {
        Self::from_dialect(ShellDialect::Cmd {
            path: PathBuf::from("cmd"),
        })
    }

    /// `cmd` on Windows, `bash` when it is on `PATH`, direct execution otherwise.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self::cmd()
        } else if detected_bash().is_some() {
            Self::bash()
        } else {
            Self::no_shell()
        }
    }

    pub fn from_dialect(dialect: ShellDialect) -> Self {
        Self {
            dialect,
            encoding: UTF_8,
        }
    }

    pub fn with_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn dialect(&self) -> &ShellDialect {
        &self.dialect
    }

    /// Encoding used for command-line text and decoded process output.
    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Explicit or detected shell binary, `None` for direct execution.
    pub fn shell_path(&self) -> Option<PathBuf> {
        match &self.dialect {
            ShellDialect::NoShell => None,
            ShellDialect::Posix { path, .. } => path.clone().or_else(|| detected_bash().map(Path::to_path_buf)),
            ShellDialect::Cmd { path } => Some(path.clone()),
        }
    }

    /// Escapes one argument value for this dialect.
    pub fn escape(&self, value: &str) -> String {
        match &self.dialect {
            ShellDialect::NoShell => cmdline::quote(value),
            ShellDialect::Posix { .. } => escape_posix(value),
            ShellDialect::Cmd { .. } => escape_cmd(value),
        }
    }

    /// Splits a command line into the program to spawn and its arguments.
    pub fn command_and_arguments(&self, line: &str) -> Result<Invocation, ShellError> {
        match &self.dialect {
            ShellDialect::NoShell => {
                let (command, rest) = cmdline::split_command(line)?;
                Ok(Invocation::from_raw(command, rest)?)
            }
            ShellDialect::Posix { prefix, .. } => {
                let shell = self.shell_path().ok_or(ShellError::ShellNotFound)?;
                let script = format!("{prefix}{line}");
                Ok(Invocation {
                    program: shell.to_string_lossy().into_owned(),
                    arguments: format!("-c \"{script}\""),
                    argv: vec!["-c".to_string(), script],
                    verbatim: false,
                })
            }
            ShellDialect::Cmd { path } => Ok(Invocation {
                program: path.to_string_lossy().into_owned(),
                arguments: format!("/c \"{line}\""),
                argv: vec!["/c".to_string(), line.to_string()],
                verbatim: true,
            }),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::platform_default()
    }
}

fn escape_posix(value: &str) -> String {
    if POSIX_BARE.is_match(value) {
        value.to_string()
    } else {
        format!("$'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

fn escape_cmd(value: &str) -> String {
    if CMD_BARE.is_match(value) {
        return value.to_string();
    }
    let carets = CMD_METACHAR.replace_all(value, "^$0");
    let quotes = CMD_QUOTE.replace_all(&carets, |caps: &Captures<'_>| {
        if caps.get(1).is_some() {
            "\\\\\\\"".to_string()
        } else {
            "\\\"".to_string()
        }
    });
    format!("\"{quotes}\"")
}
