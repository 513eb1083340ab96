//! Turning console bytes from the board into terminal text.
//!
//! Console output arrives in arbitrary fragments, so a multi-byte UTF-8
//! character can be split across two messages. [`ConsoleDecoder`] keeps
//! the incomplete tail until the rest arrives.

/// Incremental, lossy UTF-8 decoder for console fragments.
#[derive(Debug, Default)]
pub struct ConsoleDecoder {
    pending: Vec<u8>,
    last_was_cr: bool,
}

impl ConsoleDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `data`, keeping an incomplete trailing sequence for later.
    ///
    /// Invalid bytes become `U+FFFD` and never stall the stream.
    pub fn push(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    break;
                },
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&self.pending[..valid_up_to]) {
                        out.push_str(valid);
                    }
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            let end = (valid_up_to + bad).min(self.pending.len());
                            self.pending.drain(..end);
                        },
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        },
                    }
                },
            }
        }
        out
    }

    /// Like [`push`](Self::push), with `\r\n` and lone `\r` folded into `\n`.
    ///
    /// For output written to a pipe or a file rather than a terminal.
    pub fn push_lines(&mut self, data: &[u8]) -> String {
        let text = self.push(data);
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            match ch {
                '\r' => {
                    out.push('\n');
                    self.last_was_cr = true;
                    continue;
                },
                '\n' if self.last_was_cr => {},
                _ => out.push(ch),
            }
            self.last_was_cr = false;
        }
        out
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}
