//! # Pipelines
//!
//! [`Pipeline`] composes a list of stages left to right, each stage's stdout feeding
//! the next one's stdin. It is the list form of `a | b | c`:
//!
//! ```rust,no_run
//! use procpipe::{JobOptions, Pipeline};
//!
//! # async fn demo() -> Result<(), procpipe::JobError> {
//! let output = Pipeline::new(JobOptions::default())
//!     .stage("ls -1")
//!     .stage("sort -r")
//!     .stage("head -n 3")
//!     .await?;
//! println!("{output}");
//! # Ok(())
//! # }
//! ```
//!
//! Stages given as command lines are turned into jobs only when the pipeline is built,
//! so no stage can start on its own before it has been wired.

use crate::error::JobError;
use crate::expander::CommandTemplate;
use crate::job::{JobOptions, ProcessJob};
use crate::output::ProcessOutput;
use futures::future::{BoxFuture, FutureExt};
use std::{fmt, future::IntoFuture};
use tracing::debug;

enum Stage {
    Template(CommandTemplate),
    Job(ProcessJob),
}

/// An ordered list of stages piped stdout-to-stdin.
pub struct Pipeline {
    options: JobOptions,
    stages: Vec<Stage>,
    no_throw: bool,
}

impl Pipeline {
    /// An empty pipeline whose command-line stages use `options`.
    pub fn new(options: JobOptions) -> Self {
        Self {
            options,
            stages: Vec::new(),
            no_throw: false,
        }
    }

    /// Appends a stage built from a command line.
    pub fn stage(mut self, command_line: impl Into<CommandTemplate>) -> Self {
        self.stages.push(Stage::Template(command_line.into()));
        self
    }

    /// Appends an existing job. It must not have started yet unless it is the first stage.
    pub fn push(mut self, job: ProcessJob) -> Self {
        self.stages.push(Stage::Job(job));
        self
    }

    /// Awaiting the tail returns its output instead of failing on a non-zero exit.
    pub fn no_throw(mut self) -> Self {
        self.no_throw = true;
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Creates and wires every stage, returning the tail job.
    ///
    /// If a stage cannot be wired, every job this pipeline already created or wired is
    /// killed before the error is returned, so none of them starts later on its own.
    pub fn build(self) -> Result<ProcessJob, JobError> {
        let mut stages = self.stages.into_iter();
        let first = stages
            .next()
            .ok_or_else(|| JobError::InvalidState("a pipeline needs at least one stage".into()))?;

        let mut tail = match first {
            Stage::Template(template) => ProcessJob::with_options(template, self.options.clone()),
            Stage::Job(job) => job,
        };
        let mut wired = vec![tail.clone()];
        for stage in stages {
            let (next, owned) = match stage {
                Stage::Template(template) => (
                    ProcessJob::with_options(template, self.options.clone().with_redirect_standard_input(false)),
                    true,
                ),
                Stage::Job(job) => (job, false),
            };
            tail = match tail.pipe(&next) {
                Ok(tail) => tail,
                Err(e) => {
                    debug!("Pipeline stage '{}' could not be wired: {}", next.command_line(), e);
                    wired.iter().for_each(ProcessJob::kill);
                    if owned {
                        next.kill();
                    }
                    return Err(e);
                }
            };
            wired.push(tail.clone());
        }
        Ok(if self.no_throw { tail.no_throw() } else { tail })
    }

    /// Builds the pipeline and waits for every stage.
    pub async fn run(self) -> Result<ProcessOutput, JobError> {
        self.build()?.wait().await
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            match stage {
                Stage::Template(template) => write!(f, "{template}")?,
                Stage::Job(job) => f.write_str(job.command_line())?,
            }
        }
        Ok(())
    }
}

impl IntoFuture for Pipeline {
    type Output = Result<ProcessOutput, JobError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.run().boxed()
    }
}
