//! # Command Expander
//!
//! A [`CommandTemplate`] is a command line with `{}` placeholders plus the values that
//! fill them, in order. Expansion escapes every value through the active
//! [`ShellExecutor`], so a value can never break out of its argument position:
//!
//! ```rust
//! use procpipe::{command_line, shell::ShellExecutor};
//!
//! let files = vec!["a.txt".to_string(), "my notes.txt".to_string()];
//! let template = command_line!("wc -l {}", files);
//! let line = template.expand(&ShellExecutor::bash()).unwrap();
//! assert_eq!(line, "wc -l a.txt $'my notes.txt'");
//! ```
//!
//! `{{` and `}}` produce literal braces. Plain strings converted with `From` are taken as
//! finished command lines and are not scanned for placeholders at all.

use crate::error::ExpandError;
use crate::output::ProcessOutput;
use crate::shell::ShellExecutor;
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// A value substituted into a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substitution {
    /// Escaped as one argument.
    Literal(String),
    /// Each element escaped, joined with spaces.
    Sequence(Vec<String>),
    /// The trimmed combined text of a finished process, escaped as one argument.
    Output(ProcessOutput),
    /// Expands to nothing.
    Empty,
}

impl Substitution {
    fn render(&self, shell: &ShellExecutor) -> String {
        match self {
            Substitution::Literal(value) => shell.escape(value),
            Substitution::Sequence(values) => values
                .iter()
                .map(|value| shell.escape(value))
                .collect::<Vec<_>>()
                .join(" "),
            Substitution::Output(output) => shell.escape(&output.trimmed()),
            Substitution::Empty => String::new(),
        }
    }
}

impl From<&str> for Substitution {
    fn from(value: &str) -> Self {
        Substitution::Literal(value.to_string())
    }
}

impl From<String> for Substitution {
    fn from(value: String) -> Self {
        Substitution::Literal(value)
    }
}

impl From<&String> for Substitution {
    fn from(value: &String) -> Self {
        Substitution::Literal(value.clone())
    }
}

impl From<&Path> for Substitution {
    fn from(value: &Path) -> Self {
        Substitution::Literal(value.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for Substitution {
    fn from(value: PathBuf) -> Self {
        Substitution::from(value.as_path())
    }
}

impl From<&PathBuf> for Substitution {
    fn from(value: &PathBuf) -> Self {
        Substitution::from(value.as_path())
    }
}

impl<S: AsRef<str>> From<Vec<S>> for Substitution {
    fn from(values: Vec<S>) -> Self {
        Substitution::from(values.as_slice())
    }
}

impl<S: AsRef<str>> From<&[S]> for Substitution {
    fn from(values: &[S]) -> Self {
        Substitution::Sequence(values.iter().map(|v| v.as_ref().to_string()).collect())
    }
}

impl<S: AsRef<str>, const N: usize> From<[S; N]> for Substitution {
    fn from(values: [S; N]) -> Self {
        Substitution::from(values.as_slice())
    }
}

impl From<ProcessOutput> for Substitution {
    fn from(output: ProcessOutput) -> Self {
        Substitution::Output(output)
    }
}

impl From<&ProcessOutput> for Substitution {
    fn from(output: &ProcessOutput) -> Self {
        Substitution::Output(output.clone())
    }
}

impl<T: Into<Substitution>> From<Option<T>> for Substitution {
    fn from(value: Option<T>) -> Self {
        value.map_or(Substitution::Empty, Into::into)
    }
}

macro_rules! numeric_substitution {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Substitution {
            fn from(value: $ty) -> Self {
                Substitution::Literal(value.to_string())
            }
        })*
    };
}

numeric_substitution!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64, bool);

/// A command line waiting to be expanded for a particular shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    format: String,
    values: Vec<Substitution>,
    literal: bool,
}

impl CommandTemplate {
    /// A template whose `{}` placeholders are filled by [`arg`](Self::arg) values.
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            values: Vec::new(),
            literal: false,
        }
    }

    /// A finished command line, passed through without placeholder processing.
    pub fn literal(line: impl Into<String>) -> Self {
        Self {
            format: line.into(),
            values: Vec::new(),
            literal: true,
        }
    }

    /// Appends the value for the next placeholder.
    pub fn arg(mut self, value: impl Into<Substitution>) -> Self {
        self.values.push(value.into());
        self
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn values(&self) -> &[Substitution] {
        &self.values
    }

    /// Produces the final command line, escaping every value for `shell`.
    pub fn expand(&self, shell: &ShellExecutor) -> Result<String, ExpandError> {
        let format = self.format.trim();
        if self.literal {
            return Ok(format.to_string());
        }

        let mut line = String::with_capacity(format.len());
        let mut values = self.values.iter();
        let mut placeholders = 0usize;
        let mut chars = format.char_indices().peekable();

        while let Some((position, ch)) = chars.next() {
            match ch {
                '{' if chars.next_if(|&(_, next)| next == '{').is_some() => line.push('{'),
                '}' if chars.next_if(|&(_, next)| next == '}').is_some() => line.push('}'),
                '{' if chars.next_if(|&(_, next)| next == '}').is_some() => {
                    placeholders += 1;
                    if let Some(value) = values.next() {
                        line.push_str(&value.render(shell));
                    }
                }
                '{' | '}' => {
                    return Err(ExpandError::UnbalancedBrace {
                        template: format.to_string(),
                        brace: ch,
                        position,
                    });
                }
                other => line.push(other),
            }
        }

        if placeholders != self.values.len() {
            return Err(ExpandError::CountMismatch {
                placeholders,
                values: self.values.len(),
            });
        }
        Ok(line)
    }
}

impl From<&str> for CommandTemplate {
    fn from(line: &str) -> Self {
        CommandTemplate::literal(line)
    }
}

impl From<String> for CommandTemplate {
    fn from(line: String) -> Self {
        CommandTemplate::literal(line)
    }
}

impl From<&String> for CommandTemplate {
    fn from(line: &String) -> Self {
        CommandTemplate::literal(line.as_str())
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format)
    }
}

/// Builds a [`CommandTemplate`] from a format string and its placeholder values.
///
/// ```rust
/// use procpipe::command_line;
///
/// let template = command_line!("git log -n {} -- {}", 5, "src/main.rs");
/// assert_eq!(template.values().len(), 2);
/// ```
#[macro_export]
macro_rules! command_line {
    ($format:expr $(,)?) => {
        $crate::expander::CommandTemplate::new($format)
    };
    ($format:expr, $($value:expr),+ $(,)?) => {
        $crate::expander::CommandTemplate::new($format)$(.arg($value))+
    };
}
