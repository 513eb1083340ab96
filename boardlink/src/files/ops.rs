//! Small filesystem operations and board identification.

use log::debug;

use super::{args, shape_error};
use crate::error::Result;
use crate::port::Port;
use crate::protocol::RawRepl;
use crate::protocol::literal::{Value, encode_str};

/// Remove a file, or an empty directory.
pub fn remove<P: Port>(repl: &mut RawRepl<P>, path: &str) -> Result<()> {
    debug!("Removing {path}");
    repl.exec_capture(&format!(
        "{}import os\ntry:\n os.remove(_p)\nexcept OSError:\n os.rmdir(_p)",
        args(&[("p", path)])
    ))?;
    Ok(())
}

/// Create one directory. Fails if it exists.
pub fn mkdir<P: Port>(repl: &mut RawRepl<P>, path: &str) -> Result<()> {
    debug!("Creating directory {path}");
    repl.exec_capture(&format!("{}import os\nos.mkdir(_p)", args(&[("p", path)])))?;
    Ok(())
}

/// Rename `old` to `new`.
///
/// Some ports cannot rename across directories; then the file is copied
/// and the original removed.
pub fn rename<P: Port>(repl: &mut RawRepl<P>, old: &str, new: &str) -> Result<()> {
    debug!("Renaming {old} -> {new}");
    repl.exec_capture(&format!(
        "{}import os
try:
 os.rename(_a,_b)
except OSError:
 with open(_a,'rb') as s:
  with open(_b,'wb') as d:
   while True:
    c=s.read(256)
    if not c:
     break
    d.write(c)
 os.remove(_a)",
        args(&[("a", old), ("b", new)])
    ))?;
    Ok(())
}

/// Create `path` and every missing parent directory.
pub fn mkpath<P: Port>(repl: &mut RawRepl<P>, path: &str) -> Result<()> {
    let dirs = super::ancestors(path);
    if dirs.is_empty() {
        return Ok(());
    }

    let tuple: String = dirs.iter().map(|d| format!("{},", encode_str(d))).collect();
    debug!("Creating path {path}");
    repl.exec_capture(&format!(
        "_d=({tuple})\nimport os\nfor _x in _d:\n try:\n  os.mkdir(_x)\n except OSError:\n  pass"
    ))?;
    Ok(())
}

/// Board identification from `os.uname()`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Version {
    /// Port name, e.g. `rp2`.
    pub sysname: String,
    /// Network name.
    pub nodename: String,
    /// MicroPython release, e.g. `1.22.0`.
    pub release: String,
    /// Build description.
    pub version: String,
    /// Board and MCU.
    pub machine: String,
}

const VERSION_SCRIPT: &str = "import os
_u=os.uname()
print({'sysname':_u.sysname,'nodename':_u.nodename,'release':_u.release,'version':_u.version,'machine':_u.machine})";

/// Query the board's `os.uname()`.
pub fn version<P: Port>(repl: &mut RawRepl<P>) -> Result<Version> {
    let value = repl.eval_literal(VERSION_SCRIPT)?;
    let field = |key: &str| -> Result<String> {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| shape_error(&format!("uname field {key}"), &value))
    };

    Ok(Version {
        sysname: field("sysname")?,
        nodename: field("nodename")?,
        release: field("release")?,
        version: field("version")?,
        machine: field("machine")?,
    })
}
