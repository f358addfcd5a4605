//! # Logging Initialization
//!
//! Installs the global `tracing` subscriber used by the engine and the `procpipe`
//! binary. The engine itself only emits events (`tracing::debug!` lifecycle traces per
//! job, `tracing::warn!` when a stuck pipe has to be cancelled); whether and where they
//! go is decided here.
//!
//! ## Logging Configuration
//!
//! 1.  **Environment Filter (`EnvFilter`)**: verbosity follows `RUST_LOG` when it is
//!     set. Otherwise the requested level applies to every crate, with `procpipe`
//!     itself raised to `debug`.
//!
//! 2.  **Stderr Logging (default)**: events are written to `stderr` with ANSI colours.
//!     Stdout is left alone because it usually carries the piped output of the jobs.
//!
//! 3.  **File Logging (opt-in)**: with `log_to_file = true` a daily rolling file is
//!     created in the user cache directory (from the `directories` crate). If that
//!     directory cannot be determined or created, logging falls back to stderr.
//!
//! `init_logging` may be called any number of times; only the first call installs a
//! subscriber.

use anyhow::Result;
use directories::ProjectDirs;
use std::{io::stderr, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    init_logging("trace", false).expect("Failed to initialize test logging");
}

/// Initializes the logging system.
///
/// # Errors
///
/// Currently infallible; the `Result` leaves room for subscriber setup that can fail.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},procpipe=debug")));

        let log_dir = if log_to_file {
            ProjectDirs::from("dev", "procpipe", "procpipe")
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .filter(|dir| std::fs::create_dir_all(dir).is_ok())
        } else {
            None
        };

        match log_dir {
            Some(dir) => {
                let file_appender = tracing_appender::rolling::daily(dir, "procpipe.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // `try_init` so a subscriber installed by the host application wins.
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(non_blocking).with_ansi(false))
                    .try_init();
                // The guard must outlive the process so buffered events are flushed.
                Box::leak(Box::new(guard));
            }
            None => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(stderr).with_ansi(true))
                    .try_init();
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_test_logging();
        assert!(init_logging("info", false).is_ok());
        assert!(init_logging("debug", true).is_ok());
        tracing::debug!("logging initialized twice without panicking");
    }
}
