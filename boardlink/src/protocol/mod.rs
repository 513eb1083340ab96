//! Raw REPL protocol implementation.
//!
//! - [`raw_repl`]: control codes and the raw REPL state machine
//! - [`exec`]: program execution and output streaming
//! - [`literal`]: strict decoder for values printed by the board
//! - [`traceback`]: device exception parsing

pub mod exec;
pub mod literal;
pub mod raw_repl;
pub mod traceback;

pub use exec::{ByteSink, check_error, decode_literal, no_input};
pub use literal::{ParseError, Value};
pub use raw_repl::{RawRepl, ReplState};
pub use traceback::Traceback;
