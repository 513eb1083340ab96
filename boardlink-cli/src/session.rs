//! Board session for one CLI invocation.
//!
//! Opens a [`Board`], connects it (named port or probe), and renders the
//! board's mailbox events: status lines, a progress bar and console output.

use std::cell::RefCell;
use std::io::{self, IsTerminal, Write as _};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};

use boardlink::port::DEFAULT_BAUD;
use boardlink::{Board, BoardEvents, Command, ConsoleDecoder, NativeOpener, Payload};

use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output, was_interrupted, watch_cancel};

/// Mailbox wait between keyboard checks.
const IDLE_SLICE: Duration = Duration::from_millis(20);

/// Renders board events on the terminal.
pub(crate) struct Ui {
    quiet: bool,
    bar: Option<ProgressBar>,
    decoder: ConsoleDecoder,
    /// Write console output untouched (raw terminal) instead of folding
    /// line endings.
    pub(crate) raw_console: bool,
}

impl Ui {
    pub(crate) fn new(quiet: bool) -> Self {
        Self {
            quiet,
            bar: None,
            decoder: ConsoleDecoder::new(),
            raw_console: io::stdout().is_terminal(),
        }
    }

    fn bar(&mut self) -> Option<&ProgressBar> {
        if self.quiet || !use_fancy_output() {
            return None;
        }
        Some(self.bar.get_or_insert_with(|| {
            let pb = ProgressBar::new(100);
            if let Ok(bar_style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            {
                pb.set_style(bar_style.progress_chars("#>-"));
            }
            pb.set_draw_target(ProgressDrawTarget::stderr());
            pb
        }))
    }

    /// Remove the progress bar, if one is shown.
    pub(crate) fn finish(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish_and_clear();
        }
    }

    /// Print a status line above the progress bar.
    pub(crate) fn note(&self, text: &str) {
        if self.quiet {
            return;
        }
        match &self.bar {
            Some(pb) => pb.println(text),
            None => eprintln!("{text}"),
        }
    }
}

impl BoardEvents for Ui {
    fn status(&mut self, text: &str) {
        match self.bar() {
            Some(pb) => pb.set_message(text.to_string()),
            None => info!("{text}"),
        }
    }

    fn progress(&mut self, percent: Option<u8>) {
        match percent {
            Some(p) => {
                if let Some(pb) = self.bar() {
                    pb.set_position(u64::from(p));
                }
            },
            None => self.finish(),
        }
    }

    fn console(&mut self, data: &[u8]) {
        let text = if self.raw_console {
            self.decoder.push(data)
        } else {
            self.decoder.push_lines(data)
        };
        let mut out = io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn interactive(&mut self, active: bool) {
        if active {
            self.note(&style("Connected to REPL, Ctrl-X to exit").dim().to_string());
        }
    }

    fn lost(&mut self) {
        self.finish();
        eprintln!("{} Board disconnected", style("⚠").yellow());
    }
}

/// A connected board plus its renderer.
pub(crate) struct Session {
    pub(crate) board: Board,
    pub(crate) ui: Ui,
}

impl Session {
    /// Open the board on `--port`/configured port, or probe all ports.
    pub(crate) fn open(cli: &Cli, config: &mut Config) -> Result<Self> {
        let port = cli.port.clone().or_else(|| config.connection.port.clone());
        Self::connect(cli, config, port)
    }

    /// Probe every port regardless of a configured one.
    pub(crate) fn scan(cli: &Cli, config: &mut Config) -> Result<Self> {
        Self::connect(cli, config, cli.port.clone())
    }

    fn connect(cli: &Cli, config: &mut Config, port: Option<String>) -> Result<Self> {
        let baud = cli.baud.or(config.connection.baud).unwrap_or(DEFAULT_BAUD);
        let opener = Arc::new(NativeOpener::new(baud));
        let board = Board::new(opener, config.link_config(cli.soft_reset))
            .context("Failed to start the board worker")?
            .with_last_port(config.connection.last_port.clone());
        watch_cancel(board.cancel_token());

        let mut session = Self {
            board,
            ui: Ui::new(cli.quiet),
        };

        let command = match port {
            Some(port) => Command::Connect { port },
            None => Command::Scan,
        };
        let payload = session.call(command).context("Could not connect to a board")?;

        if let Payload::Port(name) = payload {
            session
                .ui
                .note(&format!("{} Connected to {}", style("✓").green(), style(&name).cyan()));
            if let Err(e) = config.remember_last_port(&name) {
                warn!("Could not save last port: {e}");
            }
        }
        Ok(session)
    }

    /// Run `command` to completion, rendering its events.
    pub(crate) fn call(&mut self, command: Command) -> Result<Payload> {
        ensure_not_interrupted()?;
        let result = self.board.call(command, &mut self.ui);
        self.ui.finish();
        settle(result, was_interrupted())
    }

    /// Run `command` while calling `idle` between mailbox polls.
    ///
    /// `idle` returns `false` to ask the command to stop. Used for commands
    /// that take keyboard input.
    pub(crate) fn call_with(
        &mut self,
        command: Command,
        mut idle: impl FnMut(&Board) -> Result<bool>,
    ) -> Result<Payload> {
        ensure_not_interrupted()?;
        let outcome: Rc<RefCell<Option<(bool, Payload)>>> = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&outcome);
        self.board.submit(command, move |success, payload| {
            *slot.borrow_mut() = Some((success, payload));
        })?;

        while !self.board.wait(&mut self.ui, IDLE_SLICE) {
            if !idle(&self.board)? {
                self.board.stop();
            }
        }
        self.ui.finish();

        let result = match outcome.borrow_mut().take() {
            Some((true, payload)) => Ok(payload),
            _ => Err(self
                .board
                .take_failure()
                .unwrap_or_else(|| boardlink::Error::Protocol("command failed".to_string()))),
        };
        settle(result, was_interrupted())
    }
}

/// Final outcome of a command. A Ctrl-C press wins over whatever error the
/// interrupted command ended with.
fn settle(result: boardlink::Result<Payload>, interrupted: bool) -> Result<Payload> {
    if interrupted {
        return Err(CliError::Cancelled("Interrupted".to_string()).into());
    }
    Ok(result?)
}

/// Fail with a cancellation error once Ctrl-C was pressed.
pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}
