//! Command implementations.
//!
//! Each group of subcommands lives in its own module.

pub(crate) mod completions;
pub(crate) mod fs;
pub(crate) mod ports;
pub(crate) mod run;
pub(crate) mod sync;
