//! Program execution in the raw REPL.
//!
//! An exec writes the source followed by CTRL-D and expects `OK`. The board
//! then prints the program's stdout, an EOT byte, the error text (empty on
//! success), a second EOT byte and finally the `>` prompt.

use std::time::{Duration, Instant};

use log::{debug, trace};

use super::literal::{self, Value};
use super::raw_repl::{RawRepl, ctrl};
use super::traceback::Traceback;
use crate::error::{Error, Result};
use crate::port::Port;

/// Timeout for the `OK` acknowledgement after the source was sent.
const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for the prompt following the second EOT.
const PROMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Receiver for program output.
pub trait ByteSink {
    /// Handle a fragment of output.
    fn consume(&mut self, data: &[u8]);
}

impl<F: FnMut(&[u8])> ByteSink for F {
    fn consume(&mut self, data: &[u8]) {
        self(data);
    }
}

impl ByteSink for Vec<u8> {
    fn consume(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }
}

/// Source of keyboard input while a program runs. Never has anything.
pub fn no_input() -> Option<Vec<u8>> {
    None
}

impl<P: Port> RawRepl<P> {
    /// Send `source` and CTRL-D, and check the `OK` acknowledgement.
    pub fn exec_raw_no_follow(&mut self, source: &[u8]) -> Result<()> {
        self.write_source(source)?;
        self.transport.write(&[ctrl::EOT])?;

        let ack = self.transport.read(2, ACK_TIMEOUT)?;
        if ack != b"OK" {
            return Err(Error::Protocol(format!(
                "could not exec command (response: {:?})",
                String::from_utf8_lossy(&ack)
            )));
        }
        Ok(())
    }

    /// Stream the running program's output to `sink` until it ends.
    ///
    /// Returns the error text, empty when the program finished cleanly.
    /// `timeout` bounds the whole call; `None` waits until the program ends,
    /// the transport fails or the cancel token aborts. A stop request is
    /// answered with one CTRL-C. Whatever `input` yields is written to the
    /// board.
    pub fn follow(
        &mut self,
        timeout: Option<Duration>,
        sink: &mut dyn ByteSink,
        input: &mut dyn FnMut() -> Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut interrupted = false;

        // stdout
        loop {
            let (data, done) = self.transport.take_until(ctrl::EOT);
            if !data.is_empty() {
                sink.consume(&data);
            }
            if done {
                break;
            }
            self.pump(deadline, &mut interrupted, input)?;
        }

        // error text
        let mut error = Vec::new();
        loop {
            let (data, done) = self.transport.take_until(ctrl::EOT);
            error.extend_from_slice(&data);
            if done {
                break;
            }
            self.pump(deadline, &mut interrupted, input)?;
        }

        match self.transport.read_until(b">", PROMPT_TIMEOUT) {
            Ok(_) => {},
            Err(Error::Timeout(_)) => debug!("No prompt after program end"),
            Err(e) => return Err(e),
        }

        trace!("Program finished, {} bytes of error text", error.len());
        Ok(error)
    }

    fn pump(
        &mut self,
        deadline: Option<Instant>,
        interrupted: &mut bool,
        input: &mut dyn FnMut() -> Option<Vec<u8>>,
    ) -> Result<()> {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::Timeout("waiting for program output".to_string()));
        }
        if !*interrupted && self.transport.cancel_token().is_stop_requested() {
            debug!("Stop requested, interrupting program");
            self.interrupt()?;
            *interrupted = true;
        }
        while let Some(bytes) = input() {
            self.transport.write(&bytes)?;
        }
        self.transport.fill()?;
        Ok(())
    }

    /// Execute `source`, streaming stdout to `sink`.
    ///
    /// Requires the raw REPL to be entered. A non-empty error section
    /// becomes [`Error::DeviceException`].
    pub fn exec(
        &mut self,
        source: &str,
        sink: &mut dyn ByteSink,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.exec_raw_no_follow(source.as_bytes())?;
        let error = self.follow(timeout, sink, &mut no_input)?;
        check_error(&error)
    }

    /// Execute `source` and return its stdout.
    pub fn exec_capture(&mut self, source: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let timeout = self.config.reply_timeout;
        self.exec(source, &mut out, Some(timeout))?;
        Ok(out)
    }

    /// Execute `source` and decode its stdout as one literal.
    pub fn eval_literal(&mut self, source: &str) -> Result<Value> {
        let out = self.exec_capture(source)?;
        decode_literal(&out)
    }

    /// Run `f` inside the raw REPL, leaving it afterwards even on failure.
    pub fn session<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.enter_with_retry()?;
        let result = f(self);
        match result {
            Ok(value) => {
                self.exit_raw_repl()?;
                Ok(value)
            },
            Err(e) => {
                if !self.transport.is_failed() && !matches!(e, Error::Aborted) {
                    let _ = self.exit_raw_repl();
                }
                Err(e)
            },
        }
    }

    /// Enter raw mode, execute `source` and leave raw mode.
    pub fn execute(
        &mut self,
        source: &str,
        sink: &mut dyn ByteSink,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.session(|repl| repl.exec(source, sink, timeout))
    }
}

/// Turn the error section of an exec reply into a result.
pub fn check_error(error: &[u8]) -> Result<()> {
    if error.is_empty() {
        return Ok(());
    }
    let text = String::from_utf8_lossy(error);
    Err(Error::DeviceException(Traceback::parse(&text)))
}

/// Decode program output as exactly one literal.
pub fn decode_literal(out: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(out)
        .map_err(|e| Error::Protocol(format!("reply is not UTF-8: {e}")))?;
    Ok(literal::parse(text)?)
}
