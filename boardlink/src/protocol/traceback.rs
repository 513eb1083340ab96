//! Device exception text.

use std::fmt;

/// A traceback printed by the board after an uncaught exception.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Traceback {
    /// File named by the innermost frame, e.g. `<stdin>`.
    pub file: Option<String>,
    /// Line number of the innermost frame.
    pub line: Option<u32>,
    /// Exception lines following the innermost frame.
    pub message: String,
    /// The full text as received.
    pub text: String,
}

impl Traceback {
    /// Parse the error section of an exec reply.
    ///
    /// The last `File "...", line N` header names the failing location and
    /// everything after it is the message. Text without any frame header is
    /// taken as the message verbatim.
    pub fn parse(text: &str) -> Self {
        let lines: Vec<&str> = text.lines().collect();
        let frame = lines
            .iter()
            .rposition(|l| l.trim_start().starts_with("File "));

        let (file, line, message_lines) = match frame {
            Some(idx) => {
                let (file, line) = parse_frame(lines[idx].trim_start());
                (file, line, &lines[idx + 1..])
            },
            None => (None, None, &lines[..]),
        };

        let message = message_lines
            .iter()
            .map(|l| l.trim_end())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            file,
            line,
            message,
            text: text.to_string(),
        }
    }

    /// Exception class name, e.g. `ValueError`.
    pub fn exception_name(&self) -> Option<&str> {
        let head = self.message.lines().next()?;
        let name = head.split(':').next().unwrap_or(head).trim();
        let is_ident = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        is_ident.then_some(name)
    }

    /// Whether the program ended because of CTRL-C.
    pub fn is_keyboard_interrupt(&self) -> bool {
        self.exception_name() == Some("KeyboardInterrupt")
    }
}

/// `File "<stdin>", line 4, in <module>` -> (`<stdin>`, 4)
fn parse_frame(header: &str) -> (Option<String>, Option<u32>) {
    let rest = header.trim_start_matches("File ").trim_start();
    let file = rest
        .strip_prefix('"')
        .and_then(|r| r.find('"').map(|end| r[..end].to_string()));

    let line = rest.find("line ").and_then(|pos| {
        rest[pos + 5..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .ok()
    });

    (file, line)
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{file}:{line}: {}", self.message),
            (None, Some(line)) => write!(f, "line {line}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}
