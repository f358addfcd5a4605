//! Small primitives shared by the `procpipe` crates.

pub mod state_machine;
