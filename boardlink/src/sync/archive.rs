//! ZIP backup archives.
//!
//! Members are keyed by device path without the leading slash and written
//! with a fixed timestamp and compression level, so the same content always
//! produces the same archive bytes.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use log::debug;
use sha1::{Digest, Sha1};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::error::Result;
use crate::files::hash::DIGEST_LEN;

/// Archive member name for a device path.
pub fn member_name(device_path: &str) -> String {
    device_path.trim_start_matches('/').to_string()
}

/// Device path for an archive member name.
pub fn device_path(member: &str) -> String {
    format!("/{}", member.trim_start_matches('/'))
}

/// An archive loaded into memory.
pub struct ArchiveReader {
    zip: ZipArchive<Cursor<Vec<u8>>>,
}

impl ArchiveReader {
    /// Load an archive from disk; `None` if the file does not exist.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path)?;
        debug!("Loaded archive {} ({} bytes)", path.display(), data.len());
        Ok(Some(Self::from_bytes(data)?))
    }

    /// Load an archive from memory.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Ok(Self {
            zip: ZipArchive::new(Cursor::new(data))?,
        })
    }

    /// File member names in archive order.
    pub fn names(&self) -> Vec<String> {
        (0..self.zip.len())
            .filter_map(|idx| self.zip.name_for_index(idx))
            .filter(|n| !n.ends_with('/'))
            .map(str::to_string)
            .collect()
    }

    /// Whether the archive has a member with this name.
    pub fn contains(&self, name: &str) -> bool {
        self.zip.index_for_name(name).is_some()
    }

    /// Read a member's content.
    pub fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut file = self.zip.by_name(name)?;
        let mut data = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// SHA-1 of a member's content.
    pub fn digest(&mut self, name: &str) -> Result<[u8; DIGEST_LEN]> {
        let data = self.read(name)?;
        Ok(Sha1::digest(&data).into())
    }

    /// Digests of every file member.
    pub fn digests(&mut self) -> Result<BTreeMap<String, [u8; DIGEST_LEN]>> {
        let mut out = BTreeMap::new();
        for name in self.names() {
            let digest = self.digest(&name)?;
            out.insert(name, digest);
        }
        Ok(out)
    }
}

/// An archive being built in memory.
pub struct ArchiveWriter {
    zip: ZipWriter<Cursor<Vec<u8>>>,
}

impl Default for ArchiveWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveWriter {
    /// Start an empty archive.
    pub fn new() -> Self {
        Self {
            zip: ZipWriter::new(Cursor::new(Vec::new())),
        }
    }

    fn options() -> SimpleFileOptions {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(6))
            .last_modified_time(DateTime::default())
            .unix_permissions(0o644)
    }

    /// Add a member.
    pub fn add(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.zip.start_file(name, Self::options())?;
        self.zip.write_all(data)?;
        Ok(())
    }

    /// Finish the archive and return its bytes.
    pub fn finish(self) -> Result<Vec<u8>> {
        Ok(self.zip.finish()?.into_inner())
    }

    /// Finish the archive and write it to `path`, replacing it atomically.
    pub fn persist(self, path: &Path) -> Result<()> {
        let data = self.finish()?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".part");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, path)?;
        debug!("Wrote archive {} ({} bytes)", path.display(), data.len());
        Ok(())
    }
}
