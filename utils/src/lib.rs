//! Small helpers shared across the mup crates: command execution with
//! captured diagnostics, and tracing setup for entrypoints. Only the
//! standard library and "core" crates belong here.

mod command;
mod tracing_util;
pub use command::*;
pub use tracing_util::*;
