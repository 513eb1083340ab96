//! Board information and file management commands.

use anyhow::{Context, Result, bail};
use console::style;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use boardlink::{Command, EntryKind, FileEntry, Payload};

use crate::config::Config;
use crate::session::Session;
use crate::{Cli, CliError};

/// Normalize a user-given board path: absolute, no trailing slash, `""`
/// for the root.
pub(crate) fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.is_empty() {
        String::new()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Like [`normalize`], rejecting the root directory.
fn target(path: &str) -> Result<String> {
    let path = normalize(path);
    if path.is_empty() {
        return Err(CliError::Usage("The root directory cannot be used here".to_string()).into());
    }
    Ok(path)
}

/// Board path for an upload of `local` to `remote`.
fn upload_path(local: &Path, remote: Option<&str>) -> Result<String> {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", local.display()))?;
    Ok(match remote {
        Some(r) if !r.ends_with('/') => normalize(r),
        Some(dir) => format!("{}/{name}", normalize(dir)),
        None => format!("/{name}"),
    })
}

/// Find the entry at `path` in a full listing.
fn find<'a>(entries: &'a [FileEntry], path: &str) -> Option<&'a FileEntry> {
    let mut level = entries;
    let mut found = None;
    for part in path.split('/').filter(|p| !p.is_empty()) {
        let entry = level.iter().find(|e| e.name == part)?;
        level = match &entry.kind {
            EntryKind::Dir(children) => children.as_slice(),
            _ => &[],
        };
        found = Some(entry);
    }
    found
}

/// One output line per entry, depth first.
fn listing_lines(dir: &str, entries: &[FileEntry], out: &mut Vec<String>) {
    for entry in entries {
        let path = format!("{dir}/{}", entry.name);
        match &entry.kind {
            EntryKind::File(size) => out.push(format!("{size:>9}  {path}")),
            EntryKind::Dir(children) => {
                out.push(format!("{:>9}  {path}/", "-"));
                listing_lines(&path, children, out);
            },
            EntryKind::Broken => out.push(format!("{:>9}  {path} (unreadable)", "?")),
        }
    }
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let mut session = Session::open(cli, config)?;
    let Payload::Version(version) = session.call(Command::GetVersion)? else {
        bail!("Unexpected reply to a version request");
    };
    let port = session.board.port().unwrap_or_default().to_string();

    if json {
        let info = serde_json::json!({
            "port": port,
            "version": version,
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("{}", style("Board").bold().underlined());
    println!("  Port:     {port}");
    println!("  System:   {}", version.sysname);
    println!("  Node:     {}", version.nodename);
    println!("  Release:  {}", version.release);
    println!("  Version:  {}", version.version);
    println!("  Machine:  {}", version.machine);
    Ok(())
}

/// Ls command implementation.
pub(crate) fn cmd_ls(cli: &Cli, config: &mut Config, path: &str, json: bool) -> Result<()> {
    let path = normalize(path);
    let mut session = Session::open(cli, config)?;
    let Payload::Listing(entries) = session.call(Command::ListDir)? else {
        bail!("Unexpected reply to a listing request");
    };

    let (dir, shown): (&str, &[FileEntry]) = if path.is_empty() {
        ("", entries.as_slice())
    } else {
        match find(&entries, &path) {
            Some(entry) => match &entry.kind {
                EntryKind::Dir(children) => (path.as_str(), children.as_slice()),
                _ => (parent_of(&path), std::slice::from_ref(entry)),
            },
            None => bail!("{path}: no such file or directory"),
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(shown)?);
        return Ok(());
    }

    let mut lines = Vec::new();
    listing_lines(dir, shown, &mut lines);
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

fn parent_of(path: &str) -> &str {
    path.rfind('/').map_or("", |pos| &path[..pos])
}

/// Get command implementation.
pub(crate) fn cmd_get(
    cli: &Cli,
    config: &mut Config,
    remote: &str,
    local: Option<&Path>,
) -> Result<()> {
    let remote = target(remote)?;
    let local = match local {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(remote.rsplit('/').next().unwrap_or(&remote)),
    };

    let mut session = Session::open(cli, config)?;
    let Payload::File(data) = session
        .call(Command::GetFile {
            path: remote.clone(),
            size: None,
        })
        .with_context(|| format!("Failed to download {remote}"))?
    else {
        bail!("Unexpected reply to a download");
    };

    fs::write(&local, &data).with_context(|| format!("Failed to write {}", local.display()))?;
    session.ui.note(&format!(
        "{} {remote} -> {} ({} bytes)",
        style("✓").green(),
        local.display(),
        data.len()
    ));
    Ok(())
}

/// Put command implementation.
pub(crate) fn cmd_put(
    cli: &Cli,
    config: &mut Config,
    local: &Path,
    remote: Option<&str>,
) -> Result<()> {
    let remote = upload_path(local, remote)?;
    let data = fs::read(local).with_context(|| format!("Failed to read {}", local.display()))?;
    let len = data.len();

    let mut session = Session::open(cli, config)?;
    session
        .call(Command::PutFile {
            path: remote.clone(),
            data,
        })
        .with_context(|| format!("Failed to upload {remote}"))?;
    session.ui.note(&format!(
        "{} {} -> {remote} ({len} bytes)",
        style("✓").green(),
        local.display()
    ));
    Ok(())
}

/// Rm command implementation.
pub(crate) fn cmd_rm(cli: &Cli, config: &mut Config, path: &str) -> Result<()> {
    let path = target(path)?;
    let mut session = Session::open(cli, config)?;
    session
        .call(Command::Remove { path: path.clone() })
        .with_context(|| format!("Failed to remove {path}"))?;
    Ok(())
}

/// Mkdir command implementation.
pub(crate) fn cmd_mkdir(cli: &Cli, config: &mut Config, path: &str) -> Result<()> {
    let path = target(path)?;
    let mut session = Session::open(cli, config)?;
    session
        .call(Command::MakeDir { path: path.clone() })
        .with_context(|| format!("Failed to create {path}"))?;
    Ok(())
}

/// Mv command implementation.
pub(crate) fn cmd_mv(cli: &Cli, config: &mut Config, from: &str, to: &str) -> Result<()> {
    let from = target(from)?;
    let to = target(to)?;
    let mut session = Session::open(cli, config)?;
    session
        .call(Command::Rename {
            from: from.clone(),
            to: to.clone(),
        })
        .with_context(|| format!("Failed to rename {from} to {to}"))?;
    Ok(())
}

/// Hash command implementation.
pub(crate) fn cmd_hash(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let mut session = Session::open(cli, config)?;
    let Payload::Hashes(table) = session.call(Command::Hash)? else {
        bail!("Unexpected reply to a hash request");
    };

    let hex: BTreeMap<&str, String> = table
        .iter()
        .map(|(path, digest)| (path.as_str(), hex::encode(digest)))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&hex)?);
    } else {
        for (path, digest) in hex {
            println!("{digest}  {path}");
        }
    }
    Ok(())
}
