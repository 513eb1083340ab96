//! Error types for boardlink.

use crate::protocol::literal::ParseError;
use crate::protocol::traceback::Traceback;
use std::io;
use thiserror::Error;

/// Result type for boardlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for boardlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, archive files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No responding board on any candidate port.
    #[error("No MicroPython board found")]
    DeviceNotFound,

    /// Protocol error (banner not seen, unexpected response shape).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device output could not be decoded as a literal.
    #[error("Invalid literal from device: {0}")]
    Literal(#[from] ParseError),

    /// The executed code raised an exception on the device.
    #[error("Device exception: {}", .0.message)]
    DeviceException(Traceback),

    /// A command is already in flight on this board.
    #[error("Board is busy with another command")]
    Busy,

    /// The command needs a connected board.
    #[error("Board is not connected")]
    NotConnected,

    /// The operation was force-aborted by the caller.
    #[error("Operation aborted")]
    Aborted,

    /// The board disappeared while a command was running.
    #[error("Connection to the board was lost")]
    Lost,

    /// A queued command failed; `origin` names a program or command.
    #[error("{text}")]
    Failed {
        /// What raised the error, empty for host-side failures.
        origin: String,
        /// Error or traceback text.
        text: String,
    },

    /// Backup archive error.
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error came from the serial transport itself.
    ///
    /// Transport errors are fatal to the connection.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Io(_) => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            _ => false,
        }
    }

    /// The device traceback, if this is a device exception.
    pub fn traceback(&self) -> Option<&Traceback> {
        match self {
            Self::DeviceException(tb) => Some(tb),
            _ => None,
        }
    }
}
