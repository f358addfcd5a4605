use anyhow::Result;
use procpipe::{
    EngineSettings, Environment, MemoryConsole, ProcessJob, ShellExecutor, Verbosity,
    settings::ShellChoice,
};
use serial_test::serial;
use std::{io::Write, sync::Arc, time::Duration};

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn new_jobs_pick_up_the_current_environment() -> Result<()> {
    let console = Arc::new(MemoryConsole::new());
    let previous = Environment::set_current(
        Environment::default()
            .with_shell(ShellExecutor::no_shell())
            .with_console(console.clone())
            .with_verbosity(Verbosity::FULL),
    );

    let result = ProcessJob::new("printf env").await;
    Environment::set_current(previous.as_ref().clone());

    assert_eq!(result?.stdout(), "env");
    assert_eq!(console.stdout_text(), "$ printf env\nenv");
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn environment_timeout_applies_to_new_jobs() -> Result<()> {
    let previous = Environment::set_current(
        Environment::default()
            .with_shell(ShellExecutor::no_shell())
            .with_console(Arc::new(MemoryConsole::new()))
            .with_verbosity(Verbosity::SILENT)
            .with_process_timeout(Duration::from_millis(100)),
    );

    let result = ProcessJob::new("sleep 5").await;
    Environment::set_current(previous.as_ref().clone());

    assert!(result.unwrap_err().is_timeout());
    Ok(())
}

#[test]
#[serial]
fn settings_file_builds_an_environment() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "shell = \"none\"\nverbosity = [\"silent\"]\ntimeout_ms = 2500")?;

    let settings = EngineSettings::load_from_file(file.path())?;
    assert_eq!(settings.shell, ShellChoice::None);

    let environment = Environment::from_settings(&settings)?;
    assert_eq!(environment.shell, ShellExecutor::no_shell());
    assert_eq!(environment.verbosity, Verbosity::SILENT);
    assert_eq!(environment.process_timeout, Duration::from_millis(2500));
    Ok(())
}
