//! # procpipe
//!
//! An engine for launching external processes, feeding and collecting their standard
//! streams, and chaining processes together the way a shell pipeline does, exposed as a
//! library API instead of a shell grammar.
//!
//! ```rust,no_run
//! use procpipe::{ProcessJob, command_line};
//!
//! # async fn demo() -> Result<(), procpipe::JobError> {
//! let branch = ProcessJob::new("git rev-parse --abbrev-ref HEAD").await?;
//! let log = ProcessJob::new(command_line!("git log -n {} {}", 3, &branch)).await?;
//! println!("{log}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **`job`**: the [`ProcessJob`] lifecycle: deferred start, stdin wiring, piping,
//!   timeouts and failure propagation.
//! - **`pipeline`**: left-to-right composition of several jobs.
//! - **`multiplexer`**: one byte source fanned out to a changing set of destinations.
//! - **`collector`**: stdout, stderr and the interleaved combined stream of one process.
//! - **`output`**: [`ProcessOutput`], the decoded result of a finished process.
//! - **`shell`** / **`expander`**: shell dialects, escaping and `{}` command templates.
//! - **`console`**: the boundary to the host's standard streams, with an in-memory variant.
//! - **`environment`** / **`settings`**: process-wide defaults and their TOML file.
//! - **`error`**: the error types returned across the crate.

pub mod collector;
pub mod console;
pub mod constants;
pub mod environment;
pub mod error;
pub mod expander;
pub mod job;
pub mod multiplexer;
pub mod output;
pub mod pipeline;
pub mod settings;
pub mod shell;
pub mod utils;

pub use console::{ConsoleProvider, MemoryConsole, SystemConsole};
pub use environment::Environment;
pub use error::{ExpandError, JobError, SettingsError};
pub use expander::CommandTemplate;
pub use job::{JobOptions, ProcessJob, Verbosity};
pub use output::ProcessOutput;
pub use pipeline::Pipeline;
pub use settings::EngineSettings;
pub use shell::ShellExecutor;
