//! # Utility Modules
//!
//! - **`logging`**: initialization of the `tracing` subscriber used by the engine and
//!   the `procpipe` binary.

pub mod logging;
