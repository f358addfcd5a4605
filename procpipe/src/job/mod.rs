//! # Process Job
//!
//! A [`ProcessJob`] owns one external process from creation to exit. Creating a job does
//! not spawn anything right away unless input is attached: the process starts exactly
//! once, on whichever happens first,
//!
//! - input is connected or stdin redirection is requested,
//! - the job is piped into another job or a stream,
//! - the result is awaited or the pid is requested,
//! - the deferred start delay (250 ms by default) elapses.
//!
//! The process's stdout and stderr each feed a [`PipeMultiplexer`]. An unpiped job fans
//! them out to the console (unless console outputs are off) and to its
//! [`OutputCollector`]; a piped job sends stdout to the next job's stdin instead.
//!
//! ```rust,no_run
//! use procpipe::{command_line, job::ProcessJob};
//!
//! # async fn demo() -> Result<(), procpipe::error::JobError> {
//! let output = ProcessJob::new(command_line!("git log -n {}", 5)).await?;
//! for line in output.lines_trimmed() {
//!     println!("{line}");
//! }
//!
//! let count = (ProcessJob::new("ls -1") | "wc -l").await?;
//! println!("{} entries", count.trimmed());
//! # Ok(())
//! # }
//! ```
//!
//! ## Failures
//!
//! Awaiting a job yields [`JobError::SpawnFailure`] (exit code 127) when the process could
//! not be created, [`JobError::NonZeroExit`] for a non-zero exit code and
//! [`JobError::TimedOut`] when the timeout killed it. In `a | b`, a failure of `a` is
//! reported by `b` even if `b` itself succeeded. [`ProcessJob::no_throw`] turns spawn and
//! exit failures back into a normal [`ProcessOutput`]; timeouts are always errors.

mod options;

pub use options::{JobOptions, Verbosity};

use crate::collector::{OutputCollector, StreamKind};
use crate::console::{ConsoleProvider, transcode};
use crate::constants::{SIGNAL_EXIT_CODE_BASE, SPAWN_FAILURE_EXIT_CODE};
use crate::error::JobError;
use crate::expander::CommandTemplate;
use crate::multiplexer::{ByteSource, Destination, DestinationId, PipeMultiplexer};
use crate::output::ProcessOutput;
use crate::shell::{Invocation, ShellError};
use futures::future::{self, BoxFuture, FutureExt};
use procpipe_common::state_machine::StateMachine;
use std::{
    fmt, io,
    future::IntoFuture,
    ops::BitOr,
    process::{ExitStatus, Stdio},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::{Child, ChildStdin},
    sync::{OnceCell, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitInfo {
    code: i32,
    timed_out: bool,
}

enum JobState {
    Created {
        redirect_stdin: bool,
        input: Option<ByteSource>,
    },
    Running(Running),
    StartFailed(Arc<io::Error>),
}

struct Running {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Arc<PipeMultiplexer>,
    stderr: Arc<PipeMultiplexer>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

/// Writes lifecycle traces to `tracing` and, with [`Verbosity::DEBUG`], to the console.
#[derive(Clone)]
struct Tracer {
    id: u64,
    echo: Option<Arc<dyn ConsoleProvider>>,
}

impl Tracer {
    fn trace(&self, message: impl fmt::Display) {
        debug!("[{}] {}", self.id, message);
        if let Some(console) = &self.echo {
            console.write_out_line(&format!("[DEBUG][{}] {}", self.id, message));
        }
    }
}

struct JobInner {
    id: u64,
    command_line: String,
    command: String,
    arguments: String,
    invocation: Result<Invocation, Arc<io::Error>>,
    options: JobOptions,
    tracer: Tracer,
    state: StateMachine<JobState>,
    collector: OutputCollector,
    previous: OnceLock<ProcessJob>,
    stdin_redirected: AtomicBool,
    piped: AtomicBool,
    outputs_wired: AtomicBool,
    no_throw: AtomicBool,
    suppress_console: AtomicBool,
    kill: CancellationToken,
    own_output: OnceLock<ProcessOutput>,
    result: OnceCell<Result<ProcessOutput, JobError>>,
}

/// Handle to one external process. Clones share the same process.
#[derive(Clone)]
pub struct ProcessJob {
    inner: Arc<JobInner>,
}

impl ProcessJob {
    /// Creates a job using the current [`Environment`](crate::environment::Environment) defaults.
    pub fn new(command_line: impl Into<CommandTemplate>) -> Self {
        Self::with_options(command_line, JobOptions::default())
    }

    pub fn with_options(command_line: impl Into<CommandTemplate>, options: JobOptions) -> Self {
        Self::from_template(None, command_line.into(), options)
    }

    /// Creates a job whose stdin is fed from `input`. The process starts immediately.
    pub fn with_input(
        input: impl AsyncRead + Send + Unpin + 'static,
        command_line: impl Into<CommandTemplate>,
        options: JobOptions,
    ) -> Self {
        Self::from_template(Some(Box::new(input)), command_line.into(), options)
    }

    /// Creates a job whose stdin receives `input`. The process starts immediately.
    pub fn with_input_bytes(
        input: impl Into<Vec<u8>>,
        command_line: impl Into<CommandTemplate>,
        options: JobOptions,
    ) -> Self {
        Self::with_input(std::io::Cursor::new(input.into()), command_line, options)
    }

    /// Creates a job from a program and an argument string, bypassing the shell.
    ///
    /// `arguments` uses the direct-exec quoting of [`crate::shell::cmdline`].
    pub fn from_raw(command: impl Into<String>, arguments: impl Into<String>, options: JobOptions) -> Self {
        let command = command.into();
        let arguments = arguments.into();
        let command_line = format!("{command} {arguments}").trim_end().to_string();
        let invocation = Invocation::from_raw(command, arguments)
            .map_err(|e| Arc::new(io::Error::new(io::ErrorKind::InvalidInput, e)));
        Self::build(None, command_line, invocation, options)
    }

    /// Creates a job from a program and pre-split arguments, bypassing the shell.
    pub fn from_argv<I, S>(program: impl Into<String>, argv: I, options: JobOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let invocation = Invocation::from_argv(program, argv);
        Self::build(None, invocation.to_string(), Ok(invocation), options)
    }

    fn from_template(input: Option<ByteSource>, template: CommandTemplate, options: JobOptions) -> Self {
        let expanded = template.expand(&options.shell);
        let (command_line, invocation) = match expanded {
            Ok(line) => {
                let invocation = options.shell.command_and_arguments(&line).map_err(shell_error_to_io);
                (line, invocation)
            }
            Err(e) => (
                template.format().trim().to_string(),
                Err(Arc::new(io::Error::new(io::ErrorKind::InvalidInput, e))),
            ),
        };
        Self::build(input, command_line, invocation, options)
    }

    fn build(
        input: Option<ByteSource>,
        command_line: String,
        invocation: Result<Invocation, Arc<io::Error>>,
        options: JobOptions,
    ) -> Self {
        let redirect_stdin = options.redirect_standard_input;
        let start_delay = options.start_delay;
        let job = ProcessJob {
            inner: Arc::new(JobInner::new(command_line, invocation, options)),
        };
        job.trace(format_args!("Created: {}", job.inner.command_line));

        if let Some(input) = input {
            job.attach_input(input);
            job.ensure_started();
        } else if redirect_stdin {
            job.mark_stdin_redirected();
            job.ensure_started();
        } else if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let deferred = job.clone();
            handle.spawn(async move {
                tokio::time::sleep(start_delay).await;
                deferred.ensure_started();
            });
        }
        job
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The command line as displayed, after expansion.
    pub fn command_line(&self) -> &str {
        &self.inner.command_line
    }

    /// The program that is spawned (the shell binary for shell dialects).
    pub fn command(&self) -> &str {
        &self.inner.command
    }

    pub fn arguments(&self) -> &str {
        &self.inner.arguments
    }

    pub fn options(&self) -> &JobOptions {
        &self.inner.options
    }

    /// The upstream job when this job is the receiving end of a pipe.
    pub fn previous(&self) -> Option<ProcessJob> {
        self.inner.previous.get().cloned()
    }

    /// Starts the process if needed and returns its OS id.
    pub fn pid(&self) -> Option<u32> {
        self.ensure_started();
        self.inner.state.inspect(|state| match state {
            JobState::Running(running) => running.pid,
            _ => None,
        })
    }

    /// Awaiting returns the output instead of failing on spawn failure or non-zero exit.
    pub fn no_throw(self) -> Self {
        self.inner.no_throw.store(true, Ordering::Release);
        self
    }

    /// Keeps the process output off the console even if the verbosity would show it.
    pub fn suppress_console_outputs(self) -> Self {
        self.inner.suppress_console.store(true, Ordering::Release);
        self
    }

    /// Forcibly terminates the process. Awaiting then reports the kill as a non-zero exit,
    /// or as a spawn failure when the process had not started yet.
    pub fn kill(&self) {
        self.trace("Kill requested");
        self.inner.kill.cancel();
    }

    /// A never-started stand-in for this job that resolves to `error`.
    fn rejected(&self, error: JobError) -> ProcessJob {
        let cause = Arc::new(io::Error::other(error.to_string()));
        let inner = JobInner {
            command: self.inner.command.clone(),
            arguments: self.inner.arguments.clone(),
            state: StateMachine::new(JobState::StartFailed(Arc::clone(&cause))),
            result: OnceCell::new_with(Some(Err(error))),
            ..JobInner::new(self.inner.command_line.clone(), Err(cause), self.inner.options.clone())
        };
        inner.tracer.trace("Rejected: invalid pipe");
        ProcessJob { inner: Arc::new(inner) }
    }

    /// Feeds `input` to the process's stdin and starts it.
    ///
    /// Fails with [`JobError::InvalidState`] if the process already started or input was
    /// already connected.
    pub fn connect_stdin(&self, input: impl AsyncRead + Send + Unpin + 'static) -> Result<(), JobError> {
        self.inner.state.transition(|state| match state {
            JobState::Created { input: Some(_), .. } => Err(JobError::InvalidState(
                "standard input is already connected to the process".into(),
            )),
            JobState::Created {
                redirect_stdin,
                input: slot,
            } => {
                *redirect_stdin = true;
                *slot = Some(Box::new(input));
                Ok(())
            }
            _ => Err(already_started()),
        })?;
        self.ensure_started();
        Ok(())
    }

    /// Opens a stdin pipe to the process. With `launch` the process starts right away.
    ///
    /// Fails with [`JobError::InvalidState`] once the process has started.
    pub fn redirect_stdin(&self, launch: bool) -> Result<(), JobError> {
        self.trace(format_args!("RedirectStandardInput: launch={launch}"));
        self.inner.state.transition(|state| match state {
            JobState::Created { redirect_stdin, .. } => {
                *redirect_stdin = true;
                Ok(())
            }
            _ => Err(already_started()),
        })?;
        if launch {
            self.ensure_started();
        }
        Ok(())
    }

    /// Takes the process's stdin for writing by hand. Starts the process if needed.
    ///
    /// Returns `None` unless stdin was redirected and nothing else claimed it. Stdin that
    /// is still unclaimed when the job is awaited is closed.
    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.ensure_started();
        self.inner.state.transition(|state| match state {
            JobState::Running(running) => running.stdin.take(),
            _ => None,
        })
    }

    /// Pipes this job's stdout into `next`'s stdin and returns `next`.
    ///
    /// Both processes are started. Fails with [`JobError::InvalidState`] if `next` has
    /// already started without a stdin pipe.
    pub fn pipe(&self, next: &ProcessJob) -> Result<ProcessJob, JobError> {
        if next.inner.previous.get().is_some() {
            return Err(JobError::InvalidState("the job is already the target of a pipe".into()));
        }
        next.redirect_stdin(false)?;
        self.ensure_started();
        next.ensure_started();

        if let Some((stdout, _)) = self.multiplexers()
            && let Some(stdin) = next.take_stdin()
        {
            self.trace(format_args!(
                "Pipe: {} -> {}",
                display_pid(self.pid()),
                display_pid(next.pid())
            ));
            stdout.stop_when_orphaned();
            stdout.connect_stream(stdin);
        }

        let _ = next.inner.previous.set(self.clone());
        self.inner.piped.store(true, Ordering::Release);
        self.ready_pipe();
        Ok(next.clone())
    }

    /// Pipes this job's stdout into an arbitrary byte sink. The sink is shut down at EOF.
    pub fn pipe_to(&self, sink: impl AsyncWrite + Send + Unpin + 'static) -> ProcessJob {
        self.ensure_started();
        if let Some((stdout, _)) = self.multiplexers() {
            stdout.connect_stream(sink);
        }
        self.inner.piped.store(true, Ordering::Release);
        self.ready_pipe();
        self.clone()
    }

    /// Waits for the process and returns its output.
    ///
    /// The process (and in a pipeline, every upstream process) is awaited once; later calls
    /// return the same result.
    pub async fn wait(&self) -> Result<ProcessOutput, JobError> {
        let result = self
            .inner
            .result
            .get_or_init(|| self.run_to_completion())
            .await
            .clone();
        match result {
            Err(e) if e.is_suppressible() && self.inner.no_throw.load(Ordering::Acquire) => {
                Ok(self.own_output().unwrap_or_else(|| ProcessOutput::empty(SPAWN_FAILURE_EXIT_CODE)))
            }
            other => other,
        }
    }

    /// Waits for the job and returns this process's own exit code, never failing.
    pub async fn exit_code(&self) -> i32 {
        let result = self.inner.result.get_or_init(|| self.run_to_completion()).await;
        match (self.own_output(), result) {
            (Some(output), _) => output.exit_code(),
            (None, Err(e)) => e.exit_code().unwrap_or(SPAWN_FAILURE_EXIT_CODE),
            (None, Ok(output)) => output.exit_code(),
        }
    }

    fn own_output(&self) -> Option<ProcessOutput> {
        self.inner.own_output.get().cloned()
    }

    fn trace(&self, message: impl fmt::Display) {
        self.inner.tracer.trace(message);
    }

    fn attach_input(&self, input: ByteSource) {
        self.inner.state.transition(|state| {
            if let JobState::Created {
                redirect_stdin,
                input: slot,
            } = state
            {
                *redirect_stdin = true;
                *slot = Some(input);
            }
        });
    }

    fn mark_stdin_redirected(&self) {
        self.inner.state.transition(|state| {
            if let JobState::Created { redirect_stdin, .. } = state {
                *redirect_stdin = true;
            }
        });
    }

    /// Starts the process exactly once. Later calls are no-ops.
    fn ensure_started(&self) {
        let started = self.inner.state.transition(|state| {
            let JobState::Created { redirect_stdin, input } = state else {
                return false;
            };
            let redirect = *redirect_stdin;
            let input = input.take();
            *state = self.inner.start(redirect, input);
            true
        });
        if started {
            self.inner.state.inspect(|state| match state {
                JobState::Running(running) => self.trace(format_args!(
                    "Started: pid={}; stdin={}",
                    display_pid(running.pid),
                    if running.stdin.is_some() { "piped" } else { "inherited" }
                )),
                JobState::StartFailed(e) => self.trace(format_args!("StartFailed: {e}")),
                JobState::Created { .. } => {}
            });
        }
    }

    fn multiplexers(&self) -> Option<(Arc<PipeMultiplexer>, Arc<PipeMultiplexer>)> {
        self.inner.state.inspect(|state| match state {
            JobState::Running(running) => Some((Arc::clone(&running.stdout), Arc::clone(&running.stderr))),
            _ => None,
        })
    }

    /// Connects console and collector (unless piped) once, then opens both readiness gates.
    fn ready_pipe(&self) {
        let Some((stdout, stderr)) = self.multiplexers() else {
            return;
        };
        let piped = self.inner.piped.load(Ordering::Acquire);
        self.trace(format_args!("ReadyPipe: piped={piped}"));

        if !piped && !self.inner.outputs_wired.swap(true, Ordering::AcqRel) {
            if !self.inner.suppress_console.load(Ordering::Acquire) {
                let console = &self.inner.options.console;
                let from = self.inner.options.shell.encoding();
                let to = console.output_encoding();
                stdout.connect_stream(transcode(console.open_standard_output(), from, to));
                stderr.connect_stream(transcode(console.open_standard_error(), from, to));
            }
            stdout.connect(Destination::Collector(self.inner.collector.sink(StreamKind::Stdout)));
            stderr.connect(Destination::Collector(self.inner.collector.sink(StreamKind::Stderr)));
        }
        stdout.ready();
        stderr.ready();
    }

    /// Result of the upstream job, if any. Boxed because pipelines recurse through it.
    fn upstream_result(&self) -> BoxFuture<'_, Result<(), JobError>> {
        async move {
            match self.previous() {
                Some(previous) => previous.wait().await.map(|_| ()),
                None => Ok(()),
            }
        }
        .boxed()
    }

    /// Fails fast when some job up the chain could not even be started.
    fn upstream_start_failure(&self) -> BoxFuture<'_, Result<(), JobError>> {
        async move {
            let Some(previous) = self.previous() else {
                return Ok(());
            };
            previous.upstream_start_failure().await?;
            previous.ensure_started();
            let failed = previous
                .inner
                .state
                .inspect(|state| matches!(state, JobState::StartFailed(_)));
            if failed {
                previous.wait().await?;
            }
            Ok(())
        }
        .boxed()
    }

    async fn run_to_completion(&self) -> Result<ProcessOutput, JobError> {
        if let Err(upstream) = self.upstream_start_failure().await {
            self.kill();
            let settled = self.settle().await;
            self.record_output(&settled);
            return Err(upstream);
        }

        // The upstream chain is driven alongside this process: its stdin has to be
        // wired or closed before this process can see EOF.
        let (settled, upstream) = future::join(self.settle(), self.upstream_result()).await;
        let output = self.record_output(&settled);
        upstream?;

        match settled {
            Err(source) => Err(JobError::SpawnFailure {
                command_line: self.inner.command_line.clone(),
                source,
                output,
            }),
            Ok(exit) if exit.code == 0 => Ok(output),
            Ok(exit) => {
                let failure = JobError::NonZeroExit {
                    command: self.inner.command.clone(),
                    command_line: self.inner.command_line.clone(),
                    pid: self.pid(),
                    output,
                };
                if exit.timed_out {
                    Err(JobError::TimedOut {
                        command_line: self.inner.command_line.clone(),
                        timeout: self.inner.options.timeout,
                        cause: Box::new(failure),
                    })
                } else {
                    Err(failure)
                }
            }
        }
    }

    /// Snapshots this process's own output; spawn failures get an empty 127 output.
    fn record_output(&self, settled: &Result<ExitInfo, Arc<io::Error>>) -> ProcessOutput {
        let output = match settled {
            Ok(exit) => self
                .inner
                .collector
                .snapshot(exit.code, self.inner.options.shell.encoding()),
            Err(_) => ProcessOutput::empty(SPAWN_FAILURE_EXIT_CODE),
        };
        self.inner.own_output.get_or_init(|| output).clone()
    }

    /// Runs the process to its exit and drains both pipes.
    async fn settle(&self) -> Result<ExitInfo, Arc<io::Error>> {
        self.ensure_started();

        let running = self.inner.state.transition(|state| match state {
            JobState::Running(running) => Ok((
                running.stdin.take(),
                Arc::clone(&running.stdout),
                Arc::clone(&running.stderr),
                running.exit.clone(),
                running.pid,
            )),
            JobState::StartFailed(e) => Err(Arc::clone(e)),
            JobState::Created { .. } => Err(Arc::new(io::Error::other("process was not started"))),
        });
        let (stdin, stdout, stderr, mut exit, pid) = running?;

        let auto_wire = stdin.and_then(|stdin| self.auto_wire_stdin(stdin));
        self.ready_pipe();

        let info = match exit.wait_for(Option::is_some).await {
            Ok(info) => (*info).unwrap_or(ExitInfo {
                code: -1,
                timed_out: false,
            }),
            Err(_) => ExitInfo {
                code: -1,
                timed_out: false,
            },
        };
        self.trace(format_args!("Exited: pid={}; code={}", display_pid(pid), info.code));

        if let Some((input, id)) = auto_wire {
            input.disconnect(id);
        }

        self.trace("Pipe/Sink complete: begin");
        stdout.complete().await;
        stderr.complete().await;
        self.trace("Pipe/Sink complete: done");
        Ok(info)
    }

    /// Forwards the console's redirected stdin into the process when nothing else feeds it.
    fn auto_wire_stdin(&self, stdin: ChildStdin) -> Option<(Arc<PipeMultiplexer>, DestinationId)> {
        let options = &self.inner.options;
        let has_stdin = self.inner.stdin_redirected.load(Ordering::Acquire);
        if options.enable_auto_wire_standard_input && !has_stdin && options.console.is_input_redirected() {
            let input = options.console.input_multiplexer();
            let sink = transcode(Box::new(stdin), options.console.input_encoding(), options.shell.encoding());
            let id = input.connect_stream(sink);
            self.trace("Stdin auto-wired to console input");
            Some((input, id))
        } else {
            drop(stdin);
            None
        }
    }
}

impl JobInner {
    fn new(command_line: String, invocation: Result<Invocation, Arc<io::Error>>, options: JobOptions) -> Self {
        let id = NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed);
        let (command, arguments) = match &invocation {
            Ok(invocation) => (invocation.program().to_string(), invocation.arguments().to_string()),
            Err(_) => (String::new(), String::new()),
        };
        let tracer = Tracer {
            id,
            echo: options
                .verbosity
                .contains(Verbosity::DEBUG)
                .then(|| Arc::clone(&options.console)),
        };
        let suppress_console = !options.verbosity.contains(Verbosity::CONSOLE_OUTPUTS);

        Self {
            id,
            command_line,
            command,
            arguments,
            invocation,
            options,
            tracer,
            state: StateMachine::new(JobState::Created {
                redirect_stdin: false,
                input: None,
            }),
            collector: OutputCollector::new(),
            previous: OnceLock::new(),
            stdin_redirected: AtomicBool::new(false),
            piped: AtomicBool::new(false),
            outputs_wired: AtomicBool::new(false),
            no_throw: AtomicBool::new(false),
            suppress_console: AtomicBool::new(suppress_console),
            kill: CancellationToken::new(),
            own_output: OnceLock::new(),
            result: OnceCell::new(),
        }
    }

    /// Spawns the process. Runs under the state lock.
    fn start(&self, redirect_stdin: bool, input: Option<ByteSource>) -> JobState {
        self.stdin_redirected.store(redirect_stdin, Ordering::Release);

        if self.options.verbosity.contains(Verbosity::COMMAND_LINE) {
            self.options
                .console
                .write_out_line(&format!("$ {}", self.command_line));
        }

        let invocation = match &self.invocation {
            Ok(invocation) => invocation,
            Err(e) => return JobState::StartFailed(Arc::clone(e)),
        };
        if self.kill.is_cancelled() {
            return JobState::StartFailed(Arc::new(io::Error::new(
                io::ErrorKind::Interrupted,
                "the job was killed before its process started",
            )));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return JobState::StartFailed(Arc::new(io::Error::other(
                "a Tokio runtime is required to start a process",
            )));
        }

        let pipe_stdin = redirect_stdin || self.options.console.is_input_redirected();
        let mut command = invocation.to_command();
        command
            .stdin(if pipe_stdin { Stdio::piped() } else { Stdio::inherit() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(directory) = &self.options.working_directory {
            command.current_dir(directory);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return JobState::StartFailed(Arc::new(e)),
        };

        let grace = self.options.pipe_grace;
        let pid = child.id();
        let stdout = PipeMultiplexer::with_grace(
            format!("{}:stdout", self.id),
            input_stream(child.stdout.take()),
            grace,
        );
        let stderr = PipeMultiplexer::with_grace(
            format!("{}:stderr", self.id),
            input_stream(child.stderr.take()),
            grace,
        );
        stdout.spawn();
        stderr.spawn();

        let mut stdin = child.stdin.take();
        if let Some(input) = input
            && let Some(child_stdin) = stdin.take()
        {
            let feeder = PipeMultiplexer::with_grace(format!("{}:stdin", self.id), input, grace);
            feeder.connect_stream(child_stdin);
            feeder.spawn();
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(wait_for_exit(
            child,
            self.options.effective_timeout(),
            self.kill.clone(),
            exit_tx,
            self.tracer.clone(),
        ));

        JobState::Running(Running {
            pid,
            stdin,
            stdout,
            stderr,
            exit: exit_rx,
        })
    }
}

/// Owns the child until it exits, enforcing the timeout and explicit kills.
async fn wait_for_exit(
    mut child: Child,
    timeout: Option<Duration>,
    kill: CancellationToken,
    exit: watch::Sender<Option<ExitInfo>>,
    tracer: Tracer,
) {
    enum Wake {
        Exited(io::Result<ExitStatus>),
        TimedOut,
        Killed,
    }

    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        _ = deadline => Wake::TimedOut,
        _ = kill.cancelled() => Wake::Killed,
    };

    let timed_out = matches!(wake, Wake::TimedOut);
    let status = match wake {
        Wake::Exited(status) => status,
        Wake::TimedOut | Wake::Killed => {
            if timed_out {
                tracer.trace(format_args!("TimedOut: pid={}", display_pid(child.id())));
            }
            if let Err(e) = child.kill().await {
                debug!("[{}] kill failed: {}", tracer.id, e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            debug!("[{}] waiting for the process failed: {}", tracer.id, e);
            -1
        }
    };
    exit.send_replace(Some(ExitInfo { code, timed_out }));
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return SIGNAL_EXIT_CODE_BASE + signal;
        }
    }
    -1
}

fn input_stream<R: AsyncRead + Send + Unpin + 'static>(stream: Option<R>) -> ByteSource {
    match stream {
        Some(stream) => Box::new(stream),
        None => Box::new(tokio::io::empty()),
    }
}

fn shell_error_to_io(error: ShellError) -> Arc<io::Error> {
    let kind = match error {
        ShellError::ShellNotFound => io::ErrorKind::NotFound,
        ShellError::Parse(_) => io::ErrorKind::InvalidInput,
    };
    Arc::new(io::Error::new(kind, error))
}

fn already_started() -> JobError {
    JobError::InvalidState(
        "the process has already been started; standard input must be configured before start".into(),
    )
}

fn display_pid(pid: Option<u32>) -> String {
    pid.map_or_else(|| "-".to_string(), |pid| pid.to_string())
}

impl fmt::Display for ProcessJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(previous) = self.inner.previous.get() {
            write!(f, "{previous} | ")?;
        }
        f.write_str(&self.inner.command_line)
    }
}

impl fmt::Debug for ProcessJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessJob")
            .field("id", &self.inner.id)
            .field("command_line", &self.inner.command_line)
            .field("previous", &self.inner.previous.get().map(ProcessJob::id))
            .finish_non_exhaustive()
    }
}

impl IntoFuture for ProcessJob {
    type Output = Result<ProcessOutput, JobError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.wait().await }.boxed()
    }
}

impl IntoFuture for &ProcessJob {
    type Output = Result<ProcessOutput, JobError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.clone().into_future()
    }
}

/// `a | b` pipes `a` into `b`. On misuse the returned job resolves to the
/// [`JobError::InvalidState`]; `b` itself is left untouched.
impl BitOr<ProcessJob> for ProcessJob {
    type Output = ProcessJob;

    fn bitor(self, next: ProcessJob) -> ProcessJob {
        match self.pipe(&next) {
            Ok(next) => next,
            Err(e) => next.rejected(e),
        }
    }
}

impl BitOr<CommandTemplate> for ProcessJob {
    type Output = ProcessJob;

    fn bitor(self, next: CommandTemplate) -> ProcessJob {
        let options = self.inner.options.clone().with_redirect_standard_input(false);
        self | ProcessJob::with_options(next, options)
    }
}

impl BitOr<&str> for ProcessJob {
    type Output = ProcessJob;

    fn bitor(self, next: &str) -> ProcessJob {
        self | CommandTemplate::from(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::MemoryConsole;
    use crate::shell::ShellExecutor;

    fn options(console: &Arc<MemoryConsole>) -> JobOptions {
        JobOptions::default()
            .with_console(Arc::clone(console) as Arc<dyn ConsoleProvider>)
            .with_verbosity(Verbosity::SILENT)
            .with_shell(ShellExecutor::no_shell())
    }

    fn quiet() -> JobOptions {
        options(&Arc::new(MemoryConsole::new()))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn collects_stdout_and_exit_code() {
        let output = ProcessJob::with_options("printf hello", quiet()).await.unwrap();
        assert_eq!(output.exit_code(), 0);
        assert_eq!(output.stdout(), "hello");
        assert_eq!(output.combined(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let job = ProcessJob::with_options("sh -c \"echo bad >&2; exit 3\"", quiet());
        let err = job.wait().await.unwrap_err();
        assert!(err.is_non_zero_exit());
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(err.output().map(ProcessOutput::stderr).as_deref(), Some("bad\n"));
        assert_eq!(job.exit_code().await, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn no_throw_returns_the_output() {
        let output = ProcessJob::with_options("sh -c \"exit 4\"", quiet())
            .no_throw()
            .await
            .unwrap();
        assert_eq!(output.exit_code(), 4);
        assert!(!output.is_success());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_failure() {
        let job = ProcessJob::with_options("definitely-not-a-real-program-4711", quiet());
        let err = job.wait().await.unwrap_err();
        assert!(err.is_spawn_failure());
        assert_eq!(err.exit_code(), Some(SPAWN_FAILURE_EXIT_CODE));
        assert_eq!(job.exit_code().await, SPAWN_FAILURE_EXIT_CODE);

        let output = ProcessJob::with_options("definitely-not-a-real-program-4711", quiet())
            .no_throw()
            .await
            .unwrap();
        assert_eq!(output.exit_code(), SPAWN_FAILURE_EXIT_CODE);
    }

    #[tokio::test]
    async fn expansion_errors_surface_as_spawn_failures() {
        let job = ProcessJob::with_options(CommandTemplate::new("echo {} {}").arg(1), quiet());
        let err = job.wait().await.unwrap_err();
        assert!(err.is_spawn_failure());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn repeated_waits_share_one_result() {
        let job = ProcessJob::with_options("printf once", quiet());
        let (first, second) = tokio::join!(job.wait(), job.wait());
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(job.wait().await.unwrap().stdout(), "once");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdin_can_only_be_connected_before_start() {
        let job = ProcessJob::with_options("cat", quiet().with_start_delay(Duration::from_secs(60)));
        job.connect_stdin(std::io::Cursor::new(b"fed".to_vec())).unwrap();

        let again = job.connect_stdin(std::io::Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(again, JobError::InvalidState(_)));
        assert!(matches!(job.redirect_stdin(true), Err(JobError::InvalidState(_))));
        assert_eq!(job.await.unwrap().stdout(), "fed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn take_stdin_writes_by_hand() {
        use tokio::io::AsyncWriteExt;

        let job = ProcessJob::with_options("cat", quiet().with_redirect_standard_input(true));
        let mut stdin = job.take_stdin().unwrap();
        stdin.write_all(b"typed").await.unwrap();
        drop(stdin);
        assert!(job.take_stdin().is_none());
        assert_eq!(job.await.unwrap().stdout(), "typed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipe_feeds_the_next_job() {
        let first = ProcessJob::with_options("printf piped", quiet());
        let second = ProcessJob::with_options("cat", quiet());
        let tail = first.pipe(&second).unwrap();

        assert_eq!(tail.id(), second.id());
        assert_eq!(tail.previous().map(|p| p.id()), Some(first.id()));
        assert_eq!(tail.to_string(), "printf piped | cat");
        assert_eq!(tail.await.unwrap().stdout(), "piped");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn a_job_is_piped_into_at_most_once() {
        let a = ProcessJob::with_options("printf a", quiet());
        let b = ProcessJob::with_options("printf b", quiet());
        let c = ProcessJob::with_options("cat", quiet());
        a.pipe(&c).unwrap();
        assert!(matches!(b.pipe(&c), Err(JobError::InvalidState(_))));
        let _ = b.no_throw().await;
        assert_eq!(c.await.unwrap().stdout(), "a");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_reports_a_non_zero_exit() {
        let job = ProcessJob::with_options("sleep 30", quiet());
        assert!(job.pid().is_some());
        job.kill();
        let err = job.wait().await.unwrap_err();
        assert!(err.is_non_zero_exit());
        assert_eq!(err.exit_code(), Some(SIGNAL_EXIT_CODE_BASE + 9));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_before_start_never_spawns() {
        let job = ProcessJob::with_options("sleep 30", quiet().with_start_delay(Duration::from_secs(60)));
        job.kill();
        assert_eq!(job.pid(), None);
        let err = job.wait().await.unwrap_err();
        assert!(err.is_spawn_failure());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_process() {
        let job = ProcessJob::with_options(
            "sleep 30",
            quiet().with_timeout(Duration::from_millis(100)),
        );
        let err = job.no_throw().wait().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn verbosity_controls_console_echo() {
        let console = Arc::new(MemoryConsole::new());
        ProcessJob::with_options("printf out", options(&console).with_verbosity(Verbosity::FULL))
            .await
            .unwrap();
        assert_eq!(console.stdout_text(), "$ printf out\nout");

        let silent = Arc::new(MemoryConsole::new());
        ProcessJob::with_options("printf out", options(&silent)).await.unwrap();
        assert_eq!(silent.stdout_text(), "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn suppressed_console_still_collects() {
        let console = Arc::new(MemoryConsole::new());
        let output = ProcessJob::with_options("printf out", options(&console).with_verbosity(Verbosity::FULL))
            .suppress_console_outputs()
            .await
            .unwrap();
        assert_eq!(output.stdout(), "out");
        assert_eq!(console.stdout_text(), "$ printf out\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn debug_verbosity_echoes_lifecycle_traces() {
        let console = Arc::new(MemoryConsole::new());
        let job = ProcessJob::with_options("true", options(&console).with_verbosity(Verbosity::DEBUG));
        let id = job.id();
        job.await.unwrap();
        let text = console.stdout_text();
        assert!(text.contains(&format!("[DEBUG][{id}] Created: true")));
        assert!(text.contains(&format!("[DEBUG][{id}] Exited:")));
    }
}
