//! Library tunables.

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::error::{Error, Result};

/// Accepted file transfer chunk sizes.
pub const CHUNK_SIZES: RangeInclusive<usize> = 1..=4096;

/// Timeouts and sizes used when talking to a board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// How long to wait for the raw REPL banner on each entry attempt.
    pub probe_timeout: Duration,
    /// Timeout for result-valued calls (listing, version, file chunks).
    pub reply_timeout: Duration,
    /// Soft-reset the board after entering the raw REPL.
    pub soft_reset: bool,
    /// Source is written in chunks of this many bytes.
    pub write_chunk: usize,
    /// Optional pause after each written chunk, for boards with small
    /// receive buffers.
    pub write_pause: Option<Duration>,
    /// File transfer chunk size in bytes.
    pub chunk_size: usize,
    /// Grace period after a stop request before the worker is aborted.
    pub stop_grace: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(10),
            soft_reset: false,
            write_chunk: 256,
            write_pause: None,
            chunk_size: 256,
            stop_grace: Duration::from_secs(1),
        }
    }
}

impl LinkConfig {
    /// Enable or disable the soft reset after raw REPL entry.
    #[must_use]
    pub fn with_soft_reset(mut self, soft_reset: bool) -> Self {
        self.soft_reset = soft_reset;
        self
    }

    /// Set the file transfer chunk size.
    ///
    /// Sizes outside [`CHUNK_SIZES`] are rejected with [`Error::Config`].
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        if !CHUNK_SIZES.contains(&chunk_size) {
            return Err(Error::Config(format!(
                "chunk size {chunk_size} is outside {}..={}",
                CHUNK_SIZES.start(),
                CHUNK_SIZES.end()
            )));
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }
}
