//! Archive entries and the tar container used to serialize them.
//!
//! Entry names are slash-separated with one leading separator
//! (`/root/sub/a.txt`). Tar refuses absolute member names, so the leading
//! separator is dropped on the way in and restored on the way out.

use anyhow::{bail, Context, Result};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tar::{Builder, EntryType, Header};

use crate::error::TransferError;

/// Canonical separator inside archive entry names
pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink(PathBuf),
}

/// One node of the tree. `content` is only present for regular files and
/// must be fully consumed before the next entry is produced.
#[derive(Debug)]
pub struct ArchiveEntry<R> {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    /// Seconds since the Unix epoch
    pub mtime: u64,
    pub size: u64,
    pub content: Option<R>,
}

impl<R> ArchiveEntry<R> {
    pub fn directory(name: String, mode: u32, mtime: u64) -> Self {
        ArchiveEntry {
            name,
            kind: EntryKind::Directory,
            mode,
            mtime,
            size: 0,
            content: None,
        }
    }

    pub fn file(name: String, mode: u32, mtime: u64, size: u64, content: R) -> Self {
        ArchiveEntry {
            name,
            kind: EntryKind::File,
            mode,
            mtime,
            size,
            content: Some(content),
        }
    }

    pub fn symlink(name: String, target: PathBuf, mode: u32, mtime: u64) -> Self {
        ArchiveEntry {
            name,
            kind: EntryKind::Symlink(target),
            mode,
            mtime,
            size: 0,
            content: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Name without its leading separator, as stored in the tar header
fn member_name(name: &str) -> Result<&str, TransferError> {
    match name.strip_prefix(SEPARATOR) {
        Some(rest) if !rest.trim_matches(SEPARATOR).is_empty() => Ok(rest),
        _ => Err(TransferError::InvalidEntryName {
            name: name.to_string(),
        }),
    }
}

/// Streams entries into a tar container written to `W`
pub struct TarWriter<W: Write> {
    builder: Builder<W>,
}

impl<W: Write> TarWriter<W> {
    pub fn new(writer: W) -> Self {
        TarWriter {
            builder: Builder::new(writer),
        }
    }

    /// Serialize one entry, streaming its content. Returns content bytes.
    pub fn append<R: Read>(&mut self, entry: ArchiveEntry<R>) -> Result<u64> {
        let path = member_name(&entry.name)?;

        let mut header = Header::new_gnu();
        header.set_mode(entry.mode & 0o7777);
        header.set_mtime(entry.mtime);

        match entry.kind {
            EntryKind::Directory => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                self.builder
                    .append_data(&mut header, path, io::empty())
                    .with_context(|| format!("failed to archive directory {}", entry.name))?;
                Ok(0)
            }
            EntryKind::Symlink(target) => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                self.builder
                    .append_link(&mut header, path, &target)
                    .with_context(|| format!("failed to archive link {}", entry.name))?;
                Ok(0)
            }
            EntryKind::File => {
                let Some(content) = entry.content else {
                    bail!("file entry {} has no content", entry.name);
                };
                header.set_entry_type(EntryType::Regular);
                header.set_size(entry.size);

                // Never let a growing file overrun the size recorded in the header.
                let mut limited = content.take(entry.size);
                self.builder
                    .append_data(&mut header, path, &mut limited)
                    .with_context(|| format!("failed to archive file {}", entry.name))?;
                if limited.limit() != 0 {
                    bail!("{} shrank while being archived", entry.name);
                }
                Ok(entry.size)
            }
        }
    }

    /// Write the end-of-archive trailer and hand back the sink
    pub fn finish(self) -> Result<W> {
        self.builder
            .into_inner()
            .context("failed to finalize archive")
    }
}

/// Reads entries back out of a tar container
pub struct TarReader<R: Read> {
    archive: tar::Archive<R>,
}

impl<R: Read> TarReader<R> {
    pub fn new(reader: R) -> Self {
        TarReader {
            archive: tar::Archive::new(reader),
        }
    }

    /// Hand every entry to `visit` in archive order. Each entry's content is
    /// only readable for the duration of the call. Reaching end-of-archive
    /// is success; the underlying reader is returned so the caller can
    /// drain any trailing bytes.
    pub fn for_each_entry<F>(mut self, mut visit: F) -> Result<R>
    where
        F: FnMut(ArchiveEntry<&mut dyn Read>) -> Result<()>,
    {
        for entry in self.archive.entries().context("failed to read archive")? {
            let mut entry = entry.context("failed to read archive entry")?;

            let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let name = format!("{}{}", SEPARATOR, raw.trim_end_matches(SEPARATOR));
            let header = entry.header();
            let mode = header.mode().unwrap_or(0o644);
            let mtime = header.mtime().unwrap_or(0);
            let entry_type = header.entry_type();

            let kind = match entry_type {
                EntryType::Directory => EntryKind::Directory,
                EntryType::Regular | EntryType::Continuous => EntryKind::File,
                EntryType::Symlink => {
                    let target = entry
                        .link_name()
                        .with_context(|| format!("bad link target for {name}"))?
                        .map(|t| t.into_owned())
                        .unwrap_or_default();
                    EntryKind::Symlink(target)
                }
                // Hard links, devices and the like have no counterpart here.
                _ => continue,
            };

            let size = entry.size();
            let archive_entry = match kind {
                EntryKind::File => {
                    ArchiveEntry::file(name, mode, mtime, size, &mut entry as &mut dyn Read)
                }
                EntryKind::Directory => ArchiveEntry::directory(name, mode, mtime),
                EntryKind::Symlink(target) => ArchiveEntry::symlink(name, target, mode, mtime),
            };
            visit(archive_entry)?;
        }

        Ok(self.archive.into_inner())
    }
}
