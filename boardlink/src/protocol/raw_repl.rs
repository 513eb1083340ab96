//! Raw REPL control-code state machine.
//!
//! Control codes are sent as `\r` followed by the code byte:
//!
//! | Code | Meaning                        |
//! |------|--------------------------------|
//! | 0x01 | enter raw REPL                 |
//! | 0x02 | leave raw REPL                 |
//! | 0x03 | interrupt (KeyboardInterrupt)  |
//! | 0x04 | execute / soft reset           |
//! | 0x05 | paste mode (unused)            |
//!
//! Entering prints the banner `raw REPL; CTRL-B to exit\r\n>`. The `>`
//! prompt is consumed as part of the banner, and the executor consumes the
//! prompt printed after each program, so a new exec always starts right
//! after a prompt.

use std::time::Duration;

use log::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::transport::Transport;

/// Control code bytes.
pub mod ctrl {
    /// CTRL-A, enter raw REPL.
    pub const ENTER_RAW: u8 = 0x01;
    /// CTRL-B, leave raw REPL.
    pub const EXIT_RAW: u8 = 0x02;
    /// CTRL-C, interrupt the running program.
    pub const INTERRUPT: u8 = 0x03;
    /// CTRL-D, execute in raw mode or soft reset.
    pub const EOT: u8 = 0x04;
    /// CTRL-E, paste mode.
    pub const PASTE: u8 = 0x05;
}

/// Banner printed when the raw REPL is entered.
pub const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";

/// Printed by the board when a soft reset starts.
pub const SOFT_REBOOT: &[u8] = b"soft reboot\r\n";

/// Prompt of the friendly REPL.
pub const FRIENDLY_PROMPT: &[u8] = b">>> ";

/// Raw REPL entry attempts before giving up.
const ENTER_ATTEMPTS: u32 = 2;

/// Time the line must stay quiet when draining interrupt output.
const SETTLE: Duration = Duration::from_millis(100);

/// Longest time spent discarding stale input before raw REPL entry.
const FLUSH_LIMIT: Duration = Duration::from_millis(100);

/// Where the board's REPL currently is, as far as the host knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplState {
    /// Friendly REPL or unknown.
    Normal,
    /// Raw REPL entry in progress.
    EnteringRaw,
    /// Raw REPL prompt consumed; ready to exec.
    Raw,
    /// Friendly REPL with console I/O forwarded to the user.
    Interactive,
}

/// Raw REPL controller owning the transport.
pub struct RawRepl<P: Port> {
    pub(crate) transport: Transport<P>,
    state: ReplState,
    pub(crate) config: LinkConfig,
}

impl<P: Port> RawRepl<P> {
    /// Create a controller over an opened transport.
    pub fn new(transport: Transport<P>, config: LinkConfig) -> Self {
        Self {
            transport,
            state: ReplState::Normal,
            config,
        }
    }

    /// Current REPL state.
    pub fn state(&self) -> ReplState {
        self.state
    }

    /// Active configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// The underlying transport.
    pub fn transport_mut(&mut self) -> &mut Transport<P> {
        &mut self.transport
    }

    fn send_ctrl(&mut self, code: u8) -> Result<()> {
        self.transport.write(&[b'\r', code])
    }

    /// Send CTRL-C.
    pub fn interrupt(&mut self) -> Result<()> {
        self.send_ctrl(ctrl::INTERRUPT)
    }

    /// Enter the raw REPL once.
    pub fn enter_raw_repl(&mut self) -> Result<()> {
        self.state = ReplState::EnteringRaw;
        match self.try_enter() {
            Ok(()) => {
                self.state = ReplState::Raw;
                Ok(())
            },
            Err(e) => {
                self.state = ReplState::Normal;
                Err(e)
            },
        }
    }

    fn try_enter(&mut self) -> Result<()> {
        let timeout = self.config.probe_timeout;

        self.interrupt()?;
        self.transport.flush_input(FLUSH_LIMIT.min(timeout))?;
        self.send_ctrl(ctrl::ENTER_RAW)?;
        self.transport.read_until(RAW_BANNER, timeout)?;
        debug!("Raw REPL banner received on {}", self.transport.port_name());

        if self.config.soft_reset {
            self.transport.write(&[ctrl::EOT])?;
            self.transport.read_until(SOFT_REBOOT, timeout)?;
            // boot.py may print before the banner comes back.
            self.transport.read_until(RAW_BANNER, timeout)?;
            debug!("Soft reset completed");
        }
        Ok(())
    }

    /// Enter the raw REPL, retrying once.
    ///
    /// Two failed attempts become a [`Error::Protocol`] error. Transport
    /// failures and aborts are returned immediately.
    pub fn enter_with_retry(&mut self) -> Result<()> {
        let mut last_error = None;

        for attempt in 1..=ENTER_ATTEMPTS {
            match self.enter_raw_repl() {
                Ok(()) => {
                    if attempt > 1 {
                        info!("Raw REPL entered on attempt {attempt}");
                    }
                    return Ok(());
                },
                Err(e) if e.is_transport() || matches!(e, Error::Aborted) => return Err(e),
                Err(e) => {
                    warn!("Raw REPL entry failed: {e} (attempt {attempt}/{ENTER_ATTEMPTS})");
                    last_error = Some(e);
                },
            }
        }

        Err(Error::Protocol(format!(
            "could not enter raw REPL on {}: {}",
            self.transport.port_name(),
            last_error.map_or_else(|| "no response".to_string(), |e| e.to_string())
        )))
    }

    /// Leave the raw REPL without waiting for the friendly prompt.
    pub fn exit_raw_repl(&mut self) -> Result<()> {
        self.send_ctrl(ctrl::EXIT_RAW)?;
        self.state = ReplState::Normal;
        Ok(())
    }

    /// Switch to the friendly REPL for interactive use.
    ///
    /// Interrupts whatever runs, leaves raw mode and waits for `>>> `.
    /// Returns the output seen on the way, so the caller can show it.
    pub fn enter_interactive(&mut self) -> Result<Vec<u8>> {
        let timeout = self.config.probe_timeout;

        self.interrupt()?;
        let mut seen = self.transport.drain_for(SETTLE, timeout)?;
        self.transport.write(b"\r")?;
        seen.extend(self.transport.drain_for(SETTLE, timeout)?);
        self.transport.write(&[ctrl::EXIT_RAW])?;
        seen.extend(self.transport.read_until(FRIENDLY_PROMPT, timeout)?);

        self.state = ReplState::Interactive;
        Ok(seen)
    }

    /// Mark the interactive session as finished.
    pub fn leave_interactive(&mut self) {
        self.state = ReplState::Normal;
    }

    /// Write program source in paced chunks.
    pub(crate) fn write_source(&mut self, source: &[u8]) -> Result<()> {
        let chunk = self.config.write_chunk.max(1);
        for part in source.chunks(chunk) {
            self.transport.write(part)?;
            if let Some(pause) = self.config.write_pause {
                std::thread::sleep(pause);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;
    use crate::transport::CancelToken;

    fn repl(sim: &SimDevice, config: LinkConfig) -> RawRepl<SimDevice> {
        RawRepl::new(Transport::new(sim.clone(), CancelToken::new()), config)
    }

    fn fast() -> LinkConfig {
        LinkConfig {
            probe_timeout: Duration::from_millis(200),
            ..LinkConfig::default()
        }
    }

    #[test]
    fn test_enter_and_exit() {
        let sim = SimDevice::new();
        let mut r = repl(&sim, fast());

        r.enter_with_retry().unwrap();
        assert_eq!(r.state(), ReplState::Raw);
        assert!(sim.in_raw_mode());

        r.exit_raw_repl().unwrap();
        assert_eq!(r.state(), ReplState::Normal);
        assert!(!sim.in_raw_mode());
    }

    #[test]
    fn test_entry_succeeds_on_second_attempt() {
        let sim = SimDevice::new();
        sim.ignore_enter_attempts(1);
        let mut r = repl(&sim, fast());

        r.enter_with_retry().unwrap();
        assert_eq!(sim.enter_requests(), 2);
    }

    #[test]
    fn test_silent_device_fails_after_two_attempts() {
        let sim = SimDevice::new();
        sim.set_responsive(false);
        let mut r = repl(&sim, fast());

        let started = std::time::Instant::now();
        let err = r.enter_with_retry().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(sim.enter_requests(), 2);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(r.state(), ReplState::Normal);
    }

    #[test]
    fn test_chatty_port_fails_within_bound() {
        let transport = Transport::new(crate::sim::ChattyPort, CancelToken::new());
        let mut r = RawRepl::new(transport, fast());

        let started = std::time::Instant::now();
        let err = r.enter_with_retry().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(r.state(), ReplState::Normal);
    }

    #[test]
    fn test_enter_interactive_on_chatty_port_is_bounded() {
        let transport = Transport::new(crate::sim::ChattyPort, CancelToken::new());
        let mut r = RawRepl::new(transport, fast());

        let started = std::time::Instant::now();
        assert!(r.enter_interactive().is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_soft_reset_waits_for_second_banner() {
        let sim = SimDevice::new();
        let mut r = repl(&sim, fast().with_soft_reset(true));

        r.enter_with_retry().unwrap();
        assert_eq!(sim.soft_resets(), 1);
        assert_eq!(r.state(), ReplState::Raw);
    }

    #[test]
    fn test_enter_interactive_reaches_friendly_prompt() {
        let sim = SimDevice::new();
        let mut r = repl(&sim, fast());

        r.enter_with_retry().unwrap();
        r.enter_interactive().unwrap();
        assert_eq!(r.state(), ReplState::Interactive);
        assert!(!sim.in_raw_mode());
    }
}
