//! Commands accepted by a [`Board`](super::Board) and their results.

use std::path::PathBuf;

use crate::files::{FileEntry, HashTable, Version};
use crate::sync::{BackupReport, RestoreReport};

/// A unit of work for the board worker.
#[derive(Debug, Clone)]
pub enum Command {
    /// Probe every candidate port, last successful first.
    Scan,
    /// Probe one named port.
    Connect {
        /// Port name.
        port: String,
    },
    /// Read `os.uname()`.
    GetVersion,
    /// List the whole filesystem.
    ListDir,
    /// Hash every file.
    Hash,
    /// Download a file.
    GetFile {
        /// Device path.
        path: String,
        /// Expected size, for progress. Looked up on the board when `None`.
        size: Option<usize>,
    },
    /// Upload a file.
    PutFile {
        /// Device path.
        path: String,
        /// File content.
        data: Vec<u8>,
    },
    /// Run a program, forwarding console I/O until it ends or is stopped.
    Run {
        /// Name shown in status and exception reports.
        name: String,
        /// Program source.
        code: String,
    },
    /// Interactive friendly REPL until stopped.
    Repl,
    /// Remove a file or empty directory.
    Remove {
        /// Device path.
        path: String,
    },
    /// Create a directory.
    MakeDir {
        /// Device path.
        path: String,
    },
    /// Rename a file or directory.
    Rename {
        /// Current device path.
        from: String,
        /// New device path.
        to: String,
    },
    /// Back up the board into a ZIP archive.
    Backup {
        /// Archive path on the host.
        archive: PathBuf,
    },
    /// Restore a ZIP archive onto the board.
    Restore {
        /// Archive path on the host.
        archive: PathBuf,
    },
}

/// Command discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    /// [`Command::Scan`]
    Scan,
    /// [`Command::Connect`]
    Connect,
    /// [`Command::GetVersion`]
    GetVersion,
    /// [`Command::ListDir`]
    ListDir,
    /// [`Command::Hash`]
    Hash,
    /// [`Command::GetFile`]
    GetFile,
    /// [`Command::PutFile`]
    PutFile,
    /// [`Command::Run`]
    Run,
    /// [`Command::Repl`]
    Repl,
    /// [`Command::Remove`]
    Remove,
    /// [`Command::MakeDir`]
    MakeDir,
    /// [`Command::Rename`]
    Rename,
    /// [`Command::Backup`]
    Backup,
    /// [`Command::Restore`]
    Restore,
}

impl CommandCode {
    /// Lowercase name for logs and reports.
    pub fn name(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Connect => "connect",
            Self::GetVersion => "version",
            Self::ListDir => "listdir",
            Self::Hash => "hash",
            Self::GetFile => "get",
            Self::PutFile => "put",
            Self::Run => "run",
            Self::Repl => "repl",
            Self::Remove => "remove",
            Self::MakeDir => "mkdir",
            Self::Rename => "rename",
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }

    /// Whether this command probes for a board rather than using one.
    pub fn is_probe(self) -> bool {
        matches!(self, Self::Scan | Self::Connect)
    }
}

impl Command {
    /// The command's discriminant.
    pub fn code(&self) -> CommandCode {
        match self {
            Self::Scan => CommandCode::Scan,
            Self::Connect { .. } => CommandCode::Connect,
            Self::GetVersion => CommandCode::GetVersion,
            Self::ListDir => CommandCode::ListDir,
            Self::Hash => CommandCode::Hash,
            Self::GetFile { .. } => CommandCode::GetFile,
            Self::PutFile { .. } => CommandCode::PutFile,
            Self::Run { .. } => CommandCode::Run,
            Self::Repl => CommandCode::Repl,
            Self::Remove { .. } => CommandCode::Remove,
            Self::MakeDir { .. } => CommandCode::MakeDir,
            Self::Rename { .. } => CommandCode::Rename,
            Self::Backup { .. } => CommandCode::Backup,
            Self::Restore { .. } => CommandCode::Restore,
        }
    }
}

/// Value delivered with a successful result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    /// Nothing to report.
    #[default]
    None,
    /// Port a probe connected to.
    Port(String),
    /// Board identification.
    Version(Version),
    /// Filesystem listing.
    Listing(Vec<FileEntry>),
    /// Path to digest table.
    Hashes(HashTable),
    /// Downloaded file content.
    File(Vec<u8>),
    /// Backup summary.
    Backup(BackupReport),
    /// Restore summary.
    Restore(RestoreReport),
}
