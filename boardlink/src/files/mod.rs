//! File operations on the board's filesystem.
//!
//! All functions here expect the raw REPL to be entered already; callers
//! wrap them in [`RawRepl::session`] so that one session covers a whole
//! transfer. Host values are always embedded as escaped literals, never
//! spliced into source text.

pub mod hash;
pub mod ops;
pub mod transfer;

use std::collections::BTreeMap;

use log::debug;

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::literal::{Value, encode_str};
use crate::protocol::RawRepl;

pub use hash::{HashTable, hash_tree};
pub use ops::{Version, mkdir, mkpath, remove, rename, version};
pub use transfer::{get_file, put_file};

/// Sentinel size the listing script uses for unreadable entries.
const BROKEN_SIZE: i64 = -1;

/// What a directory entry is.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EntryKind {
    /// Regular file with its size in bytes.
    File(u32),
    /// Directory with its children.
    Dir(Vec<FileEntry>),
    /// Entry whose listing could not be read (unformatted or corrupt flash).
    Broken,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileEntry {
    /// Entry name without its directory.
    pub name: String,
    /// Entry kind.
    pub kind: EntryKind,
}

impl FileEntry {
    /// Whether this entry is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Dir(_))
    }
}

/// Join a device directory and a name into an absolute path.
pub fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    format!("{dir}/{name}")
}

/// Every absolute path from `/` down to `path`, excluding `/` itself.
///
/// `"/a/b/c"` gives `["/a", "/a/b", "/a/b/c"]`.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current = join(&current, part);
        out.push(current.clone());
    }
    out
}

/// The directory part of an absolute path, `None` for top-level entries.
pub fn parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(pos) => Some(&trimmed[..pos]),
    }
}

/// Absolute paths and sizes of every file in a listing, depth first.
pub fn walk_files(entries: &[FileEntry]) -> Vec<(String, u32)> {
    fn walk(dir: &str, entries: &[FileEntry], out: &mut Vec<(String, u32)>) {
        for entry in entries {
            let path = join(dir, &entry.name);
            match &entry.kind {
                EntryKind::File(size) => out.push((path, *size)),
                EntryKind::Dir(children) => walk(&path, children, out),
                EntryKind::Broken => {},
            }
        }
    }

    let mut out = Vec::new();
    walk("", entries, &mut out);
    out
}

/// Absolute paths of every broken entry in a listing.
pub fn broken_paths(entries: &[FileEntry]) -> Vec<String> {
    fn walk(dir: &str, entries: &[FileEntry], out: &mut Vec<String>) {
        for entry in entries {
            let path = join(dir, &entry.name);
            match &entry.kind {
                EntryKind::Broken => out.push(path),
                EntryKind::Dir(children) => walk(&path, children, out),
                EntryKind::File(_) => {},
            }
        }
    }

    let mut out = Vec::new();
    walk("", entries, &mut out);
    out
}

const LISTDIR_SCRIPT: &str = "import os
def _l(d):
 r=[]
 for e in os.ilistdir(d or '/'):
  n=e[0]
  p=d+'/'+n
  if not n or ord(n[0])<32 or ord(n[0])==255:
   r.append((n,-1))
  elif e[1]&0x4000:
   try:
    r.append((n,_l(p)))
   except OSError:
    r.append((n,-1))
  else:
   r.append((n,e[3] if len(e)>3 else os.stat(p)[6]))
 return r
print(_l(''))";

/// List the whole filesystem in one device-side traversal.
pub fn listdir<P: Port>(repl: &mut RawRepl<P>) -> Result<Vec<FileEntry>> {
    let value = repl.eval_literal(LISTDIR_SCRIPT)?;
    let entries = decode_entries(&value)?;
    debug!("Listed {} top-level entries", entries.len());
    Ok(entries)
}

fn decode_entries(value: &Value) -> Result<Vec<FileEntry>> {
    let items = value
        .as_seq()
        .ok_or_else(|| shape_error("listing", value))?;
    items.iter().map(decode_entry).collect()
}

fn decode_entry(item: &Value) -> Result<FileEntry> {
    let (name, detail) = match item.as_seq() {
        Some([name, detail]) => (name, detail),
        _ => return Err(shape_error("listing entry", item)),
    };
    let name = name
        .as_str()
        .ok_or_else(|| shape_error("entry name", name))?
        .to_string();

    let kind = match detail {
        Value::Int(BROKEN_SIZE) => EntryKind::Broken,
        Value::Int(size) => EntryKind::File(
            u32::try_from(*size).map_err(|_| shape_error("file size", detail))?,
        ),
        Value::List(_) | Value::Tuple(_) => EntryKind::Dir(decode_entries(detail)?),
        other => return Err(shape_error("entry detail", other)),
    };
    Ok(FileEntry { name, kind })
}

pub(crate) fn shape_error(what: &str, value: &Value) -> Error {
    Error::Protocol(format!("unexpected {what}: got {}", value.kind()))
}

/// Argument preamble binding `_name` to each literal.
pub(crate) fn args(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(name, path)| format!("_{name}={}\n", encode_str(path)))
        .collect()
}

/// Index a listing by absolute path.
pub fn index_sizes(entries: &[FileEntry]) -> BTreeMap<String, u32> {
    walk_files(entries).into_iter().collect()
}
