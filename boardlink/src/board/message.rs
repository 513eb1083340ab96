//! Mailbox messages from the worker to the board owner.

use super::command::Payload;

/// One event produced while a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Human-readable status line.
    Status(String),
    /// Progress in percent; `None` clears the indicator.
    Progress(Option<u8>),
    /// Console output from the board.
    Console(Vec<u8>),
    /// The program was accepted by the board and is running.
    CodeDownloaded,
    /// Interactive console mode started or ended.
    Interactive(bool),
    /// The device disappeared; the connection was dropped.
    Lost,
    /// The command failed. `source` names what raised (a program name or
    /// a command), empty for host-side errors.
    Exception {
        /// Origin of the exception.
        source: String,
        /// Exception text.
        text: String,
    },
    /// Terminal result; always the last message of a command.
    Result {
        /// Whether the command succeeded.
        success: bool,
        /// Result value.
        payload: Payload,
    },
}

/// Receives board events during [`Board::poll`](super::Board::poll).
///
/// Every method has an empty default so consumers only implement what they
/// show.
pub trait BoardEvents {
    /// Status line changed.
    fn status(&mut self, _text: &str) {}

    /// Progress changed.
    fn progress(&mut self, _percent: Option<u8>) {}

    /// Console output arrived.
    fn console(&mut self, _data: &[u8]) {}

    /// A program was downloaded and started.
    fn code_downloaded(&mut self) {}

    /// Interactive mode toggled.
    fn interactive(&mut self, _active: bool) {}

    /// The board was lost.
    fn lost(&mut self) {}

    /// A command failed with an exception.
    fn exception(&mut self, _source: &str, _text: &str) {}
}

/// Event consumer that ignores everything.
impl BoardEvents for () {}

/// Merge adjacent console fragments, keeping every other message in place.
pub fn coalesce(messages: impl IntoIterator<Item = Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::new();
    for message in messages {
        if let Message::Console(data) = &message {
            if let Some(Message::Console(prev)) = out.last_mut() {
                prev.extend_from_slice(data);
                continue;
            }
        }
        out.push(message);
    }
    out
}

/// Integer percentage of `done` out of `total`; an empty total is complete.
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(done.min(total) * 100 / total).unwrap_or(100)
}

/// Turns `(done, total)` updates into non-decreasing percentages.
#[derive(Debug, Default)]
pub struct ProgressMeter {
    last: Option<u8>,
}

impl ProgressMeter {
    /// Returns a percentage only when it moved forward.
    pub fn update(&mut self, done: usize, total: usize) -> Option<u8> {
        let p = percent(done, total);
        if self.last.is_some_and(|last| p <= last) {
            return None;
        }
        self.last = Some(p);
        Some(p)
    }

    /// Start a new transfer.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
