use anyhow::{Context, Result};
use clap::Parser;
use procpipe::{
    CommandTemplate, ConsoleProvider, EngineSettings, Environment, JobError, JobOptions, Pipeline, Verbosity,
    settings::ShellChoice, utils::logging::init_logging,
};
use std::{path::PathBuf, process::ExitCode};
use tracing::{debug, error};

/// Runs command lines as a pipeline, each stage's stdout feeding the next stage's stdin.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Shell dialect used to run each stage.
    #[arg(long)]
    shell: Option<ShellChoice>,

    /// Kill every stage that runs longer than this many milliseconds (0 = never).
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Report the tail's output instead of failing on a non-zero exit.
    #[arg(long)]
    no_throw: bool,

    /// What to echo: silent, command-line, outputs, full or debug (comma separated).
    #[arg(long)]
    verbosity: Option<Verbosity>,

    /// TOML settings file with engine defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level for diagnostics written to stderr.
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Write diagnostics to a daily log file in the user cache directory.
    #[arg(long)]
    log_to_file: bool,

    /// Command lines to run, piped left to right.
    #[arg(required = true)]
    stages: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_to_file)?;

    let settings = load_settings(&cli)?;
    let mut environment = Environment::from_settings(&settings).context("Invalid engine settings")?;
    if let Some(verbosity) = cli.verbosity {
        environment.verbosity = verbosity;
    }
    let verbosity = environment.verbosity;
    let console = environment.console.clone();
    Environment::set_current(environment);

    let pipeline = cli
        .stages
        .iter()
        .fold(Pipeline::new(JobOptions::default()), |pipeline, stage| {
            pipeline.stage(CommandTemplate::literal(stage.as_str()))
        });
    let pipeline = if cli.no_throw { pipeline.no_throw() } else { pipeline };
    debug!("Running pipeline: {}", pipeline);

    let code = match pipeline.run().await {
        Ok(output) => {
            if !verbosity.contains(Verbosity::CONSOLE_OUTPUTS) {
                print!("{output}");
            }
            output.exit_code()
        }
        Err(e) => {
            error!("{} failure: {}", e.error_category(), e);
            if let JobError::InvalidState(_) = e {
                console.write_error_line(&e.to_string());
            } else if let Some(output) = e.output()
                && !verbosity.contains(Verbosity::CONSOLE_OUTPUTS)
            {
                print!("{output}");
            }
            e.exit_code().unwrap_or(1)
        }
    };

    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

fn load_settings(cli: &Cli) -> Result<EngineSettings> {
    let mut settings = match &cli.config {
        Some(path) => EngineSettings::load_from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => EngineSettings::default(),
    };
    settings
        .apply_env_overrides()
        .context("Invalid PROCPIPE_* environment variable")?;

    if let Some(shell) = cli.shell {
        settings.shell = shell;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        settings.timeout_ms = timeout_ms;
    }
    Ok(settings)
}
