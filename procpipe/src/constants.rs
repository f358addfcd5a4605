//! # Engine Constants
//!
//! Central home for the timing windows, buffer sizes and sentinel values the engine
//! relies on. Settings files and `JobOptions` override most of these per process or
//! per job; the values here are what you get when nothing is configured.
//!
//! - **`DEFAULT_START_DELAY`**: how long a freshly created job waits before starting
//!   on its own. The window lets callers attach an input stream or pipe the job into
//!   another one before the process is spawned.
//! - **`DEFAULT_PIPE_GRACE`**: how long `PipeMultiplexer::complete` waits for the
//!   read/dispatch loop to drain before cancelling it.
//! - **`SPAWN_FAILURE_EXIT_CODE`**: the synthetic exit code reported when the OS
//!   refused to create the process, mirroring the POSIX "command not found" code.

use std::time::Duration;

/// Delay before a job with no configured input starts itself.
pub const DEFAULT_START_DELAY: Duration = Duration::from_millis(250);

/// Grace period granted to a multiplexer loop during graceful completion.
pub const DEFAULT_PIPE_GRACE: Duration = Duration::from_secs(1);

/// Size of a single read from a process stream.
pub const READ_CHUNK_SIZE: usize = 80 * 1024;

/// Exit code reported when a process could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Offset added to a terminating signal number to form an exit code (`128 + SIGKILL` = 137).
pub const SIGNAL_EXIT_CODE_BASE: i32 = 128;

/// Script prefix prepended by the POSIX dialect to every command line.
pub const DEFAULT_POSIX_PREFIX: &str = "set -euo pipefail;";

/// Prefix of the environment variables read by `EngineSettings::apply_env_overrides`.
pub const ENV_PREFIX: &str = "PROCPIPE_";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_failure_code_matches_shell_convention() {
        assert_eq!(SPAWN_FAILURE_EXIT_CODE, 127);
        assert_eq!(SIGNAL_EXIT_CODE_BASE + 9, 137);
    }

    #[test]
    fn grace_period_outlasts_start_delay() {
        assert!(DEFAULT_PIPE_GRACE > DEFAULT_START_DELAY);
    }
}
