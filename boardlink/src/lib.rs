//! # boardlink
//!
//! A library for driving MicroPython boards over a serial line.
//!
//! Everything goes through the board's raw REPL: programs are pasted in and
//! their output streamed back, and file operations are small device-side
//! scripts whose printed results are parsed as Python literals.
//!
//! - Raw REPL entry, exit and program execution ([`protocol`])
//! - Filesystem listing, hashing and chunked transfers ([`files`])
//! - Hash-verified ZIP backup and restore ([`sync`])
//! - A worker-thread front-end with a message mailbox ([`board`])
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: serialization of listings, reports and tracebacks
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use boardlink::{Board, Command, LinkConfig, NativeOpener, Payload};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let opener = Arc::new(NativeOpener::new(115_200));
//!     let mut board = Board::new(opener, LinkConfig::default())?;
//!
//!     board.call(Command::Scan, &mut ())?;
//!     if let Payload::Version(v) = board.call(Command::GetVersion, &mut ())? {
//!         println!("{} {}", v.machine, v.release);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod board;
pub mod config;
pub mod console;
pub mod device;
pub mod error;
pub mod files;
pub mod port;
pub mod protocol;
pub mod sync;
pub mod transport;

#[cfg(test)]
pub(crate) mod sim;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativeOpener, NativePort};
pub use {
    board::{
        Board, BoardEvents, Callback, Command, CommandCode, ConnectionState, Message, Payload,
    },
    config::LinkConfig,
    console::ConsoleDecoder,
    device::{DetectedPort, DeviceKind, detect_ports, format_port_list},
    error::{Error, Result},
    files::{EntryKind, FileEntry, HashTable, Version},
    port::{Port, PortOpener, SerialConfig},
    protocol::{RawRepl, Traceback, Value},
    sync::{BackupReport, Reporter, RestoreReport},
    transport::{CancelToken, Transport},
};
