//! Hash-verified backup and restore.
//!
//! Both directions compare SHA-1 digests computed on the board with digests
//! of the archive members and only transfer files whose content differs.

pub mod archive;
pub mod backup;
pub mod restore;

pub use archive::{ArchiveReader, ArchiveWriter, device_path, member_name};
pub use backup::{BackupReport, backup};
pub use restore::{RestoreReport, restore};

/// Receives progress from a sync run.
pub trait Reporter {
    /// A new phase started; progress restarts from zero.
    fn begin(&mut self, text: &str) {
        self.status(text);
    }

    /// A new file started.
    fn status(&mut self, text: &str);

    /// `done` of `total` steps in the current phase.
    fn progress(&mut self, done: usize, total: usize);
}

/// Discards all reports.
impl Reporter for () {
    fn status(&mut self, _text: &str) {}

    fn progress(&mut self, _done: usize, _total: usize) {}
}

/// Whether `path` is one of `dirs` or lies below one of them.
pub(crate) fn is_under(path: &str, dirs: &[String]) -> bool {
    dirs.iter().any(|d| {
        path == d
            || path
                .strip_prefix(d.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    })
}
