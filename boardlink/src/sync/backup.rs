//! Board to archive.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use log::{info, warn};

use super::archive::{ArchiveReader, ArchiveWriter, device_path, member_name};
use super::{Reporter, is_under};
use crate::error::Result;
use crate::files::{broken_paths, get_file, hash_tree, index_sizes, listdir};
use crate::port::Port;
use crate::protocol::RawRepl;

/// What a backup did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BackupReport {
    /// Device files downloaded because they were new or changed.
    pub transferred: Vec<String>,
    /// Device files copied from the previous archive unchanged.
    pub skipped: Vec<String>,
    /// Previous archive members with no counterpart on the board.
    pub orphaned: Vec<String>,
    /// Unreadable device subtrees that were left out.
    pub broken: Vec<String>,
}

/// Back up every readable file on the board into `archive`.
///
/// An existing archive is used as the baseline: members whose digest
/// matches the board are carried over without a transfer. Members below
/// an unreadable subtree are kept as they were.
pub fn backup<P: Port>(
    repl: &mut RawRepl<P>,
    archive: &Path,
    reporter: &mut dyn Reporter,
) -> Result<BackupReport> {
    let mut old = ArchiveReader::open(archive)?;
    let old_digests = match old.as_mut() {
        Some(reader) => reader.digests()?,
        None => BTreeMap::new(),
    };

    reporter.begin("Hashing files on board");
    let (hashes, sizes, broken) = repl.session(|r| {
        let listing = listdir(r)?;
        let hashes = hash_tree(r, &mut |done, total| reporter.progress(done, total))?;
        Ok((hashes, index_sizes(&listing), broken_paths(&listing)))
    })?;
    for path in &broken {
        warn!("Skipping unreadable subtree {path}");
    }

    let mut report = BackupReport {
        broken: broken.clone(),
        ..BackupReport::default()
    };
    let mut writer = ArchiveWriter::new();
    let mut referenced = BTreeSet::new();
    let total = hashes.len();

    reporter.begin("Transferring files");
    repl.session(|r| {
        for (idx, (path, digest)) in hashes.iter().enumerate() {
            let name = member_name(path);
            referenced.insert(name.clone());

            match old.as_mut() {
                Some(reader) if old_digests.get(&name) == Some(digest) => {
                    writer.add(&name, &reader.read(&name)?)?;
                    report.skipped.push(path.clone());
                },
                _ => {
                    reporter.status(&format!("Downloading {path}"));
                    let size = sizes.get(path).map(|s| *s as usize);
                    let data = get_file(r, path, size, &mut |_, _| {})?;
                    writer.add(&name, &data)?;
                    report.transferred.push(path.clone());
                },
            }
            reporter.progress(idx + 1, total);
        }
        Ok(())
    })?;

    if let Some(reader) = old.as_mut() {
        for name in reader.names() {
            if referenced.contains(&name) {
                continue;
            }
            if is_under(&device_path(&name), &broken) {
                writer.add(&name, &reader.read(&name)?)?;
            } else {
                report.orphaned.push(device_path(&name));
            }
        }
    }

    writer.persist(archive)?;
    info!(
        "Backup done: {} transferred, {} unchanged, {} orphaned",
        report.transferred.len(),
        report.skipped.len(),
        report.orphaned.len()
    );
    Ok(report)
}
