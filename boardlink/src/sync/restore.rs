//! Archive to board.

use std::collections::BTreeSet;
use std::path::Path;

use log::{info, warn};

use super::archive::{ArchiveReader, device_path};
use super::{Reporter, is_under};
use crate::error::{Error, Result};
use crate::files::{broken_paths, hash_tree, listdir, mkpath, parent, put_file};
use crate::port::Port;
use crate::protocol::RawRepl;

/// What a restore did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RestoreReport {
    /// Files written to the board.
    pub transferred: Vec<String>,
    /// Files already identical on the board.
    pub skipped: Vec<String>,
    /// Board files that are not in the archive. Nothing is deleted; the
    /// caller decides.
    pub deletion_candidates: Vec<String>,
    /// Unreadable board subtrees; archive members below them were skipped.
    pub broken: Vec<String>,
}

/// Restore `archive` onto the board.
///
/// Members are written in archive order, creating parent directories as
/// needed. Files whose digest already matches are left alone.
pub fn restore<P: Port>(
    repl: &mut RawRepl<P>,
    archive: &Path,
    reporter: &mut dyn Reporter,
) -> Result<RestoreReport> {
    let mut reader = ArchiveReader::open(archive)?.ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("archive {} not found", archive.display()),
        ))
    })?;
    let members = reader.names();
    let digests = reader.digests()?;

    reporter.begin("Hashing files on board");
    let (on_board, broken) = repl.session(|r| {
        let listing = listdir(r)?;
        let hashes = hash_tree(r, &mut |done, total| reporter.progress(done, total))?;
        Ok((hashes, broken_paths(&listing)))
    })?;

    let mut report = RestoreReport {
        broken: broken.clone(),
        ..RestoreReport::default()
    };
    let mut created = BTreeSet::new();
    let total = members.len();

    reporter.begin("Transferring files");
    repl.session(|r| {
        for (idx, name) in members.iter().enumerate() {
            let path = device_path(name);

            if is_under(&path, &broken) {
                warn!("Not restoring {path}: parent directory is unreadable");
            } else if on_board.get(&path) == digests.get(name) {
                report.skipped.push(path);
            } else {
                if let Some(dir) = parent(&path) {
                    if created.insert(dir.to_string()) {
                        mkpath(r, dir)?;
                    }
                }
                reporter.status(&format!("Uploading {path}"));
                put_file(r, &path, &reader.read(name)?, &mut |_, _| {})?;
                report.transferred.push(path);
            }
            reporter.progress(idx + 1, total);
        }
        Ok(())
    })?;

    let in_archive: BTreeSet<String> = members.iter().map(|m| device_path(m)).collect();
    report.deletion_candidates = on_board
        .keys()
        .filter(|p| !in_archive.contains(*p))
        .cloned()
        .collect();

    info!(
        "Restore done: {} transferred, {} unchanged, {} not in archive",
        report.transferred.len(),
        report.skipped.len(),
        report.deletion_candidates.len()
    );
    Ok(report)
}
