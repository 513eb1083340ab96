//! Program execution and the interactive REPL.

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, unbounded};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use log::debug;
use std::io::{self, BufRead, IsTerminal};
use std::path::Path;
use std::thread;
use std::time::Duration;

use boardlink::Command;

use crate::config::Config;
use crate::session::Session;
use crate::{Cli, CliError};

/// Keyboard poll interval while the REPL is open.
const KEY_POLL: Duration = Duration::from_millis(10);

/// Ctrl-X leaves the REPL.
const EXIT_KEY: char = 'x';

/// Run command implementation.
pub(crate) fn cmd_run(cli: &Cli, config: &mut Config, file: &Path) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let code = String::from_utf8(bytes)
        .with_context(|| format!("{} is not valid UTF-8", file.display()))?;
    let name = file
        .file_name()
        .map_or_else(|| file.display().to_string(), |n| n.to_string_lossy().into_owned());

    let mut session = Session::open(cli, config)?;
    let lines = spawn_stdin_reader();
    session.call_with(Command::Run { name, code }, |board| {
        while let Ok(line) = lines.try_recv() {
            board.input(&line);
        }
        Ok(true)
    })?;
    Ok(())
}

/// Forward host stdin lines, terminated with `\r`, to the running program.
///
/// The reader thread is detached: it blocks on stdin and dies with the
/// process.
fn spawn_stdin_reader() -> Receiver<Vec<u8>> {
    let (tx, rx) = unbounded();
    let spawned = thread::Builder::new()
        .name("boardlink-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let mut data = line.into_bytes();
                data.push(b'\r');
                if tx.send(data).is_err() {
                    break;
                }
            }
            debug!("stdin closed");
        });
    if let Err(e) = spawned {
        debug!("No stdin forwarding: {e}");
    }
    rx
}

/// Repl command implementation.
pub(crate) fn cmd_repl(cli: &Cli, config: &mut Config) -> Result<()> {
    if !io::stdin().is_terminal() {
        return Err(CliError::Usage("The REPL needs an interactive terminal".to_string()).into());
    }

    let mut session = Session::open(cli, config)?;
    session.ui.raw_console = true;

    terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
    let _raw_guard = RawModeGuard;

    session.call_with(Command::Repl, |board| {
        while event::poll(KEY_POLL)? {
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind == KeyEventKind::Release {
                continue;
            }
            if is_exit_key(&key) {
                return Ok(false);
            }
            if let Some(bytes) = key_bytes(key.code, key.modifiers) {
                board.input(&bytes);
            }
        }
        Ok(true)
    })?;
    Ok(())
}

fn is_exit_key(key: &KeyEvent) -> bool {
    key.code == KeyCode::Char(EXIT_KEY) && key.modifiers.contains(KeyModifiers::CONTROL)
}

/// Bytes a terminal would send for a key press.
fn key_bytes(code: KeyCode, modifiers: KeyModifiers) -> Option<Vec<u8>> {
    let bytes = match code {
        KeyCode::Char(c) if modifiers.contains(KeyModifiers::CONTROL) => {
            if !c.is_ascii_alphabetic() {
                return None;
            }
            vec![(c.to_ascii_lowercase() as u8) & 0x1f]
        },
        KeyCode::Char(c) => {
            let mut buf = [0u8; 4];
            c.encode_utf8(&mut buf).as_bytes().to_vec()
        },
        KeyCode::Enter => b"\r".to_vec(),
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Tab => b"\t".to_vec(),
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        _ => return None,
    };
    Some(bytes)
}

/// Restores cooked terminal mode on drop.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}
