//! Port abstraction for serial communication with a board.
//!
//! The protocol layers never touch `serialport` directly. They work against
//! the [`Port`] trait, which keeps them testable against a simulated device
//! and leaves room for other byte transports.
//!
//! ```text
//! +-------------------+
//! |  files / sync     |
//! +---------+---------+
//!           |
//! +---------v---------+
//! |  raw REPL / exec  |
//! +---------+---------+
//!           |
//! +---------v---------+
//! |  Transport        |   buffered, sliced reads
//! +---------+---------+
//!           |
//! +---------v---------+
//! |  Port trait       |
//! +---------+---------+
//!           |
//! +---------v---------+
//! | NativePort        |   serialport crate
//! +-------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default baud rate. USB CDC boards ignore it, UART bridges need it.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Per-call read/write timeout of the underlying handle.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_millis(20),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Byte-level port used by the transport.
///
/// Reads must return within the configured timeout, either with data,
/// `Ok(0)` or an error of kind `TimedOut`/`WouldBlock`.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Number of bytes waiting in the receive buffer.
    ///
    /// Also used as a cheap liveness probe: a vanished device fails here.
    fn bytes_to_read(&mut self) -> Result<u32>;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        (**self).bytes_to_read()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Source of ports for the board worker.
///
/// The worker owns the opened port; the opener only knows how to find and
/// open candidates.
pub trait PortOpener: Send + Sync {
    /// Candidate port names, in preferred probe order.
    fn candidates(&self) -> Vec<String>;

    /// Open the named port.
    fn open(&self, name: &str) -> Result<Box<dyn Port>>;
}

/// Put `preferred` first in `candidates` if present.
///
/// The last port that worked is probed first to keep reconnects fast.
pub fn order_candidates(mut candidates: Vec<String>, preferred: Option<&str>) -> Vec<String> {
    if let Some(preferred) = preferred {
        if let Some(pos) = candidates.iter().position(|c| c == preferred) {
            let port = candidates.remove(pos);
            candidates.insert(0, port);
        }
    }
    candidates
}

#[cfg(feature = "native")]
pub use native::{NativeOpener, NativePort};
