#![cfg(unix)]

use anyhow::Result;
use encoding_rs::{UTF_8, WINDOWS_1252};
use procpipe::{
    CommandTemplate, ConsoleProvider, JobError, JobOptions, MemoryConsole, Pipeline, ProcessJob,
    ShellExecutor, Verbosity,
};
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;

fn options_with(console: &Arc<MemoryConsole>) -> JobOptions {
    JobOptions::default()
        .with_console(Arc::clone(console) as Arc<dyn ConsoleProvider>)
        .with_verbosity(Verbosity::SILENT)
        .with_shell(ShellExecutor::no_shell())
}

fn options() -> JobOptions {
    options_with(&Arc::new(MemoryConsole::new()))
}

#[tokio::test]
async fn bitor_chains_three_jobs() -> Result<()> {
    let job = ProcessJob::with_options("printf c\\nb\\na\\n", options()) | "sort" | "head -n 1";
    assert_eq!(job.to_string(), "printf c\\nb\\na\\n | sort | head -n 1");
    assert_eq!(job.await?.trimmed(), "a");
    Ok(())
}

#[tokio::test]
async fn upstream_failure_wins_over_downstream_success() -> Result<()> {
    let tail = ProcessJob::with_options("sh -c \"printf data; exit 3\"", options()) | "cat";
    let err = tail.wait().await.unwrap_err();

    assert!(err.is_non_zero_exit());
    assert_eq!(err.exit_code(), Some(3));
    assert_eq!(err.command_line(), Some("sh -c \"printf data; exit 3\""));
    assert_eq!(tail.exit_code().await, 0);
    Ok(())
}

#[tokio::test]
async fn upstream_spawn_failure_reaches_the_tail() -> Result<()> {
    let tail = ProcessJob::with_options("no-such-program-for-procpipe", options()) | "cat";
    let err = tail.wait().await.unwrap_err();
    assert!(err.is_spawn_failure());
    assert_eq!(err.exit_code(), Some(127));
    Ok(())
}

#[tokio::test]
async fn upstream_no_throw_is_honoured() -> Result<()> {
    let tail = ProcessJob::with_options("sh -c \"printf kept; exit 1\"", options()).no_throw() | "cat";
    assert_eq!(tail.await?.stdout(), "kept");
    Ok(())
}

#[tokio::test]
async fn endless_producer_stops_when_consumer_exits() -> Result<()> {
    let tail = ProcessJob::with_options("yes", options()).no_throw() | "head -n 2";
    let output = timeout(Duration::from_secs(10), tail.wait()).await??;
    assert_eq!(output.stdout(), "y\ny\n");
    Ok(())
}

#[tokio::test]
async fn piped_jobs_do_not_echo_their_stdout() -> Result<()> {
    let console = Arc::new(MemoryConsole::new());
    let options = options_with(&console).with_verbosity(Verbosity::CONSOLE_OUTPUTS);
    let tail = ProcessJob::with_options("printf middle", options.clone())
        | ProcessJob::with_options("tr a-z A-Z", options);
    assert_eq!(tail.await?.stdout(), "MIDDLE");
    assert_eq!(console.stdout_text(), "MIDDLE");
    Ok(())
}

#[tokio::test]
async fn pipe_to_a_stream() -> Result<()> {
    let console = Arc::new(MemoryConsole::new());
    let job = ProcessJob::with_options("printf streamed", options()).pipe_to(console.open_standard_output());
    job.await?;
    assert_eq!(console.stdout_text(), "streamed");
    Ok(())
}

#[tokio::test]
async fn pipeline_builder_matches_bitor() -> Result<()> {
    let output = Pipeline::new(options())
        .stage("printf one\\ntwo\\nthree\\n")
        .stage(CommandTemplate::literal("wc -l"))
        .await?;
    assert_eq!(output.trimmed().trim(), "3");
    Ok(())
}

#[tokio::test]
async fn pipeline_failure_in_the_middle() -> Result<()> {
    let err = Pipeline::new(options())
        .stage("printf x")
        .stage("sh -c \"cat >/dev/null; exit 5\"")
        .stage("cat")
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(5));
    Ok(())
}

#[tokio::test]
async fn joining_a_started_job_leaves_it_untouched() -> Result<()> {
    let started = ProcessJob::with_options("sleep 30", options());
    let _ = started.pid();

    let tail = ProcessJob::with_options("printf x", options()) | started.clone();
    assert!(matches!(tail.wait().await, Err(JobError::InvalidState(_))));

    started.kill();
    let err = started.wait().await.unwrap_err();
    assert!(err.is_non_zero_exit());
    assert_eq!(err.exit_code(), Some(137));
    Ok(())
}

const PIPE_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn console_input_feeds_the_first_of_two_stages() -> Result<()> {
    let console = Arc::new(MemoryConsole::with_input("hello\n"));
    let tail = ProcessJob::with_options("cat", options_with(&console)) | "tr a-z A-Z";
    let output = timeout(PIPE_DEADLINE, tail.wait()).await??;
    assert_eq!(output.stdout(), "HELLO\n");
    Ok(())
}

#[tokio::test]
async fn console_input_feeds_the_first_of_three_stages() -> Result<()> {
    let console = Arc::new(MemoryConsole::with_input("b\na\nc\n"));
    let output = timeout(
        PIPE_DEADLINE,
        Pipeline::new(options_with(&console))
            .stage("cat")
            .stage("sort")
            .stage("head -n 2")
            .run(),
    )
    .await??;
    assert_eq!(output.stdout(), "a\nb\n");
    Ok(())
}

#[tokio::test]
async fn disabled_auto_wire_closes_the_first_stage_input() -> Result<()> {
    let console = Arc::new(MemoryConsole::with_input("ignored\n"));
    let first = ProcessJob::with_options(
        "cat",
        options_with(&console).with_auto_wire_standard_input(false),
    );
    let tail = first | "tr a-z A-Z";
    let output = timeout(PIPE_DEADLINE, tail.wait()).await??;
    assert_eq!(output.stdout(), "");
    Ok(())
}

#[tokio::test]
async fn disabled_auto_wire_in_a_three_stage_pipeline() -> Result<()> {
    let console = Arc::new(MemoryConsole::with_input("ignored\n"));
    let output = timeout(
        PIPE_DEADLINE,
        Pipeline::new(options_with(&console).with_auto_wire_standard_input(false))
            .stage("cat")
            .stage("cat")
            .stage("wc -c")
            .run(),
    )
    .await??;
    assert_eq!(output.trimmed().trim(), "0");
    Ok(())
}

#[tokio::test]
async fn console_input_is_re_encoded_for_the_process() -> Result<()> {
    let console = Arc::new(
        MemoryConsole::with_input(vec![b'c', b'a', b'f', 0xE9]).with_encodings(WINDOWS_1252, UTF_8),
    );
    let tail = ProcessJob::with_options("cat", options_with(&console)) | "cat";
    let output = timeout(PIPE_DEADLINE, tail.wait()).await??;
    assert_eq!(output.stdout(), "café");
    Ok(())
}
