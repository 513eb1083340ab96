//! Recursive SHA-1 hashing on the board.
//!
//! The device walks its filesystem once, prints the number of files and
//! then one `(path, hexdigest)` literal per line. Lines are parsed as they
//! arrive so progress can be reported during long hashes.

use std::collections::BTreeMap;

use log::{debug, warn};

use super::shape_error;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::exec::ByteSink;
use crate::protocol::literal::{self, Value};
use crate::protocol::{RawRepl, check_error, no_input};

/// SHA-1 digest length in bytes.
pub const DIGEST_LEN: usize = 20;

/// Absolute device path to SHA-1 digest, ordered by path.
pub type HashTable = BTreeMap<String, [u8; DIGEST_LEN]>;

const HASH_SCRIPT: &str = "import os,hashlib,binascii
def _h(d):
 for e in os.ilistdir(d or '/'):
  n=e[0]
  if not n or ord(n[0])<32 or ord(n[0])==255:
   continue
  p=d+'/'+n
  if e[1]&0x4000:
   try:
    yield from _h(p)
   except OSError:
    pass
  else:
   yield p
_f=list(_h(''))
print(len(_f))
for _p in _f:
 _s=hashlib.sha1()
 with open(_p,'rb') as _x:
  while True:
   _b=_x.read(256)
   if not _b:
    break
   _s.update(_b)
 print((_p,binascii.hexlify(_s.digest())))";

/// Line parser fed by the executor.
struct HashCollector<'a> {
    line: Vec<u8>,
    expected: Option<usize>,
    table: HashTable,
    error: Option<Error>,
    progress: &'a mut dyn FnMut(usize, usize),
}

impl HashCollector<'_> {
    fn handle_line(&mut self, line: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(line)
            .map_err(|e| Error::Protocol(format!("hash line is not UTF-8: {e}")))?
            .trim();
        if text.is_empty() {
            return Ok(());
        }

        let value = literal::parse(text)?;
        match self.expected {
            None => {
                let count = value
                    .as_int()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| shape_error("file count", &value))?;
                debug!("Board reports {count} files to hash");
                self.expected = Some(count);
                (self.progress)(0, count);
            },
            Some(expected) => {
                let (path, digest) = decode_hash_line(&value)?;
                self.table.insert(path, digest);
                (self.progress)(self.table.len().min(expected), expected);
            },
        }
        Ok(())
    }
}

impl ByteSink for HashCollector<'_> {
    fn consume(&mut self, data: &[u8]) {
        for &b in data {
            if b != b'\n' {
                self.line.push(b);
                continue;
            }
            let line = std::mem::take(&mut self.line);
            if self.error.is_none() {
                if let Err(e) = self.handle_line(&line) {
                    self.error = Some(e);
                }
            }
        }
    }
}

fn decode_hash_line(value: &Value) -> Result<(String, [u8; DIGEST_LEN])> {
    let (path, hexdigest) = match value.as_seq() {
        Some([Value::Str(path), Value::Bytes(hexdigest)]) => (path, hexdigest),
        _ => return Err(shape_error("hash entry", value)),
    };

    let mut digest = [0u8; DIGEST_LEN];
    hex::decode_to_slice(hexdigest, &mut digest)
        .map_err(|e| Error::Protocol(format!("bad digest for {path}: {e}")))?;
    Ok((path.clone(), digest))
}

/// Hash every readable file on the board.
///
/// `progress` receives `(parsed, expected)`. The hash is never retried;
/// unreadable subtrees are left out of the table.
pub fn hash_tree<P: Port>(
    repl: &mut RawRepl<P>,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<HashTable> {
    let mut collector = HashCollector {
        line: Vec::new(),
        expected: None,
        table: HashTable::new(),
        error: None,
        progress,
    };

    repl.exec_raw_no_follow(HASH_SCRIPT.as_bytes())?;
    let error = repl.follow(None, &mut collector, &mut no_input)?;
    check_error(&error)?;

    // A last line without a newline still counts.
    if !collector.line.is_empty() && collector.error.is_none() {
        let line = std::mem::take(&mut collector.line);
        if let Err(e) = collector.handle_line(&line) {
            collector.error = Some(e);
        }
    }
    if let Some(e) = collector.error {
        return Err(e);
    }

    let expected = collector
        .expected
        .ok_or_else(|| Error::Protocol("hash reply had no file count".to_string()))?;
    if collector.table.len() != expected {
        warn!(
            "Board announced {expected} files but hashed {}",
            collector.table.len()
        );
    }
    Ok(collector.table)
}
