//! Buffered byte transport on top of a [`Port`].
//!
//! Every read is built from short port-level reads so that a blocked
//! operation notices a [`CancelToken`] abort within one port timeout. The
//! transport never reconnects on its own: once a write fails it stays
//! failed and the owner is expected to drop it.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::port::Port;

/// Size of one port-level read.
const READ_SLICE: usize = 256;

/// Cooperative cancellation shared between a caller and the worker.
///
/// `stop` is a polite request that the running program ends (the executor
/// answers it with CTRL-C). `abort` makes every transport read or write
/// fail with [`Error::Aborted`].
#[derive(Debug, Default)]
pub struct CancelToken {
    stop: AtomicBool,
    abort: AtomicBool,
}

impl CancelToken {
    /// Create a new token with both flags cleared.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ask the current operation to stop.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Force the current operation to unwind.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Whether an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Clear both flags before the next operation.
    pub fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.abort.store(false, Ordering::SeqCst);
    }
}

/// Buffered transport owning one port.
pub struct Transport<P: Port> {
    port: P,
    rx: VecDeque<u8>,
    cancel: Arc<CancelToken>,
    failed: bool,
}

impl<P: Port> Transport<P> {
    /// Wrap an opened port.
    pub fn new(port: P, cancel: Arc<CancelToken>) -> Self {
        Self {
            port,
            rx: VecDeque::new(),
            cancel,
            failed: false,
        }
    }

    /// The cancellation token observed by this transport.
    pub fn cancel_token(&self) -> &Arc<CancelToken> {
        &self.cancel
    }

    /// Name of the underlying port.
    pub fn port_name(&self) -> &str {
        self.port.name()
    }

    /// Whether a write or read has failed on this transport.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Probe the port with a "bytes waiting" query.
    pub fn is_alive(&mut self) -> bool {
        !self.failed && self.port.bytes_to_read().is_ok()
    }

    /// Number of bytes already buffered on the host side.
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    fn check_abort(&self) -> Result<()> {
        if self.cancel.is_aborted() {
            return Err(Error::Aborted);
        }
        Ok(())
    }

    /// Perform one port-level read into the buffer.
    ///
    /// Returns the number of bytes received; zero means the port timed out.
    pub fn fill(&mut self) -> Result<usize> {
        self.check_abort()?;

        let mut buf = [0u8; READ_SLICE];
        match self.port.read(&mut buf) {
            Ok(n) => {
                if n > 0 {
                    trace!("rx {:?}", String::from_utf8_lossy(&buf[..n]));
                    self.rx.extend(&buf[..n]);
                }
                Ok(n)
            },
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                debug!("Read failed on {}: {e}", self.port.name());
                self.failed = true;
                Err(Error::Io(e))
            },
        }
    }

    /// Read up to `n` bytes, returning fewer if `timeout` elapses first.
    pub fn read(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        while self.rx.len() < n && Instant::now() < deadline {
            self.fill()?;
        }
        let take = n.min(self.rx.len());
        Ok(self.rx.drain(..take).collect())
    }

    /// Read until `ending` has been received, including it.
    ///
    /// Fails with [`Error::Timeout`] if `ending` does not arrive in time.
    /// The bytes received so far are consumed either way.
    pub fn read_until(&mut self, ending: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut scanned = 0;

        loop {
            if let Some(end) = find(&self.rx, ending, scanned) {
                let data: Vec<u8> = self.rx.drain(..end + ending.len()).collect();
                return Ok(data);
            }
            scanned = self.rx.len().saturating_sub(ending.len().saturating_sub(1));

            if Instant::now() >= deadline {
                let partial: Vec<u8> = self.rx.drain(..).collect();
                debug!(
                    "Timed out waiting for {:?}, got {:?}",
                    String::from_utf8_lossy(ending),
                    String::from_utf8_lossy(&partial)
                );
                return Err(Error::Timeout(format!(
                    "waiting for {:?}",
                    String::from_utf8_lossy(ending)
                )));
            }
            self.fill()?;
        }
    }

    /// Take buffered bytes up to `marker`.
    ///
    /// Returns the bytes before the marker and whether the marker was found.
    /// A found marker is consumed; without one the whole buffer is returned.
    pub fn take_until(&mut self, marker: u8) -> (Vec<u8>, bool) {
        match self.rx.iter().position(|&b| b == marker) {
            Some(pos) => {
                let data: Vec<u8> = self.rx.drain(..pos).collect();
                self.rx.pop_front();
                (data, true)
            },
            None => (self.rx.drain(..).collect(), false),
        }
    }

    /// Take everything that is buffered.
    pub fn take_all(&mut self) -> Vec<u8> {
        self.rx.drain(..).collect()
    }

    /// Discard pending input both in the buffer and in the port.
    ///
    /// Gives up after `limit` on a line that keeps talking.
    pub fn flush_input(&mut self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        self.rx.clear();
        while self.port.bytes_to_read().map_err(|e| self.fail(e))? > 0 {
            if Instant::now() >= deadline {
                debug!("{} still sending, flush stopped", self.port.name());
                break;
            }
            if self.fill()? == 0 {
                break;
            }
            self.rx.clear();
        }
        self.rx.clear();
        Ok(())
    }

    /// Read input until the line has been quiet for `quiet`, or for at most
    /// `limit` overall.
    pub fn drain_for(&mut self, quiet: Duration, limit: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + limit;
        let mut last = Instant::now();
        let mut data = Vec::new();
        while last.elapsed() < quiet && Instant::now() < deadline {
            if self.fill()? > 0 {
                data.extend(self.rx.drain(..));
                last = Instant::now();
            }
        }
        data.extend(self.rx.drain(..));
        Ok(data)
    }

    /// Write all bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_abort()?;
        trace!("tx {:?}", String::from_utf8_lossy(data));
        if let Err(e) = self.port.write_all_bytes(data) {
            debug!("Write failed on {}: {e}", self.port.name());
            self.failed = true;
            return Err(e);
        }
        Ok(())
    }

    fn fail(&mut self, e: Error) -> Error {
        self.failed = true;
        e
    }

    /// Mutable access to the port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Close the port.
    pub fn close(&mut self) -> Result<()> {
        self.rx.clear();
        self.port.close()
    }
}

fn find(haystack: &VecDeque<u8>, needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if haystack.len() < needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len())
        .find(|&start| needle.iter().enumerate().all(|(i, b)| haystack[start + i] == *b))
}
