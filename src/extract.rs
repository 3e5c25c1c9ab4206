//! Materializes archive entries under a target root directory.
//!
//! The first segment of every entry name is the directory that was
//! archived; it is replaced by the caller's target root. Extraction is not
//! transactional: on failure, whatever was already written stays.

use anyhow::{Context, Result};
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::archive::{ArchiveEntry, EntryKind, TarReader, SEPARATOR};
use crate::cancel::CancelToken;
use crate::error::TransferError;
use crate::logger::Logger;
use crate::transfer::TransferStats;

/// Owner write+search, needed to populate a directory
const OWNER_WX: u32 = 0o300;

/// Local path for an archive entry name, with the first segment swapped
/// for `target_root`. Empty segments from doubled separators are ignored.
pub fn local_path(target_root: &Path, name: &str) -> Result<PathBuf, TransferError> {
    let invalid = || TransferError::InvalidEntryName {
        name: name.to_string(),
    };
    let segments: Vec<&str> = name
        .split(SEPARATOR)
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() || segments.iter().any(|s| *s == "..") {
        return Err(invalid());
    }
    // Backslashes would be separators on Windows; refuse them everywhere.
    if segments.iter().any(|s| s.contains('\\')) {
        return Err(invalid());
    }

    let mut path = target_root.to_path_buf();
    for segment in &segments[1..] {
        path.push(segment);
    }
    Ok(path)
}

pub struct Extractor<'a> {
    target_root: PathBuf,
    logger: &'a dyn Logger,
    cancel: CancelToken,
    stats: TransferStats,
    /// Directories whose recorded mode would block their own population
    deferred_modes: Vec<(PathBuf, u32)>,
}

impl<'a> Extractor<'a> {
    pub fn new(target_root: &Path, logger: &'a dyn Logger, cancel: &CancelToken) -> Self {
        Extractor {
            target_root: target_root.to_path_buf(),
            logger,
            cancel: cancel.clone(),
            stats: TransferStats::default(),
            deferred_modes: Vec::new(),
        }
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn into_stats(self) -> TransferStats {
        self.stats
    }

    /// Extract every entry of a tar stream. Returns the reader positioned
    /// after the end-of-archive marker.
    pub fn extract_archive<R: Read>(&mut self, reader: R) -> Result<R> {
        let rest = TarReader::new(reader).for_each_entry(|entry| self.extract_entry(entry))?;
        self.apply_deferred_modes()?;
        Ok(rest)
    }

    pub fn extract_entry(&mut self, entry: ArchiveEntry<&mut dyn Read>) -> Result<()> {
        self.cancel.check()?;
        let path = local_path(&self.target_root, &entry.name)?;

        let result = self
            .check_parents(&entry.name, &path)
            .and_then(|()| match entry.kind.clone() {
                EntryKind::Directory => self.make_dir(&path, entry.mode),
                EntryKind::Symlink(target) => self.make_symlink(&path, &target),
                EntryKind::File => self.write_file(&path, entry),
            });
        if let Err(ref err) = result {
            self.logger.error("extract", &path, &format!("{err:#}"));
        }
        result
    }

    /// Fails when any directory between the target root and `path` is a
    /// symlink, so an archive cannot redirect its own entries elsewhere.
    fn check_parents(&self, name: &str, path: &Path) -> Result<()> {
        let Some(parent) = path
            .strip_prefix(&self.target_root)
            .ok()
            .and_then(Path::parent)
        else {
            return Ok(());
        };
        let mut dir = self.target_root.clone();
        for component in parent.components() {
            dir.push(component);
            match fs::symlink_metadata(&dir) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(TransferError::InvalidEntryName {
                        name: name.to_string(),
                    }
                    .into());
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn make_dir(&mut self, path: &Path, mode: u32) -> Result<()> {
        unlink_symlink(path)?;
        if !path.exists() {
            self.logger.mkdir(path);
            fs::create_dir(path)
                .with_context(|| format!("failed to create directory {}", path.display()))?;
            if mode & OWNER_WX == OWNER_WX {
                set_mode(path, mode)?;
            } else {
                set_mode(path, mode | OWNER_WX)?;
                self.deferred_modes.push((path.to_path_buf(), mode));
            }
        }
        self.stats.record(&EntryKind::Directory, 0);
        Ok(())
    }

    fn write_file(&mut self, path: &Path, entry: ArchiveEntry<&mut dyn Read>) -> Result<()> {
        self.logger.entry(&entry.name, path);
        unlink_symlink(path)?;
        let mut out = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let copied = match entry.content {
            Some(content) => io::copy(content, &mut out)
                .with_context(|| format!("failed to write {}", path.display()))?,
            None => 0,
        };
        drop(out);

        set_mode(path, entry.mode)?;
        filetime::set_file_mtime(path, FileTime::from_unix_time(entry.mtime as i64, 0))
            .with_context(|| format!("failed to set mtime on {}", path.display()))?;

        self.stats.record(&EntryKind::File, copied);
        Ok(())
    }

    #[cfg(unix)]
    fn make_symlink(&mut self, path: &Path, target: &Path) -> Result<()> {
        if fs::symlink_metadata(path).is_ok() {
            fs::remove_file(path)
                .with_context(|| format!("failed to replace {}", path.display()))?;
        }
        std::os::unix::fs::symlink(target, path)
            .with_context(|| format!("failed to create link {}", path.display()))?;
        self.stats.record(&EntryKind::Symlink(target.to_path_buf()), 0);
        Ok(())
    }

    #[cfg(not(unix))]
    fn make_symlink(&mut self, path: &Path, _target: &Path) -> Result<()> {
        self.logger
            .error("extract", path, "symbolic links are not supported here, skipped");
        Ok(())
    }

    fn apply_deferred_modes(&mut self) -> Result<()> {
        for (path, mode) in self.deferred_modes.drain(..).rev() {
            set_mode(&path, mode)?;
        }
        Ok(())
    }
}

/// Removes a symlink sitting where an entry goes; it is never written through.
fn unlink_symlink(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(path)
            .with_context(|| format!("failed to replace link {}", path.display())),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::TarWriter;
    use crate::logger::NoopLogger;
    use tempfile::TempDir;

    fn sample_archive() -> Vec<u8> {
        let mut tar = TarWriter::new(Vec::new());
        tar.append(ArchiveEntry::<&[u8]>::directory("/root".into(), 0o755, 0))
            .unwrap();
        tar.append(ArchiveEntry::file("/root/a.txt".into(), 0o644, 1_600_000_000, 2, &b"hi"[..]))
            .unwrap();
        tar.append(ArchiveEntry::<&[u8]>::directory("/root/sub".into(), 0o755, 0))
            .unwrap();
        tar.finish().unwrap()
    }

    #[test]
    fn test_local_path() {
        let root = Path::new("/target");
        assert_eq!(local_path(root, "/root").unwrap(), PathBuf::from("/target"));
        assert_eq!(
            local_path(root, "/root//sub///a.txt").unwrap(),
            PathBuf::from("/target/sub/a.txt")
        );
        assert_eq!(
            local_path(root, "root/./a").unwrap(),
            PathBuf::from("/target/a")
        );
        for bad in ["", "/", "//", "/root/../etc", "/root/a\\b"] {
            assert!(
                matches!(local_path(root, bad), Err(TransferError::InvalidEntryName { .. })),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn test_extract_into_existing_directories() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        fs::create_dir_all(out.join("sub")).unwrap();

        let archive = sample_archive();
        let mut extractor = Extractor::new(&out, &NoopLogger, &CancelToken::new());
        extractor.extract_archive(&archive[..]).unwrap();

        assert_eq!(fs::read_to_string(out.join("a.txt")).unwrap(), "hi");
        assert!(out.join("sub").is_dir());
        let stats = extractor.into_stats();
        assert_eq!((stats.entries, stats.files, stats.directories, stats.bytes), (3, 1, 2, 2));

        let mtime = FileTime::from_last_modification_time(&fs::metadata(out.join("a.txt")).unwrap());
        assert_eq!(mtime.unix_seconds(), 1_600_000_000);
    }

    #[test]
    fn test_failure_keeps_earlier_files() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");

        let mut tar = TarWriter::new(Vec::new());
        tar.append(ArchiveEntry::<&[u8]>::directory("/root".into(), 0o755, 0))
            .unwrap();
        tar.append(ArchiveEntry::file("/root/a.txt".into(), 0o644, 0, 2, &b"hi"[..]))
            .unwrap();
        // Parent directory never recorded, so this file cannot be created.
        tar.append(ArchiveEntry::file("/root/missing/b.txt".into(), 0o644, 0, 1, &b"b"[..]))
            .unwrap();
        let archive = tar.finish().unwrap();

        let mut extractor = Extractor::new(&out, &NoopLogger, &CancelToken::new());
        assert!(extractor.extract_archive(&archive[..]).is_err());
        assert_eq!(fs::read_to_string(out.join("a.txt")).unwrap(), "hi");
        assert!(!out.join("missing").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_entries_never_land_outside_target() {
        let tmp = TempDir::new().unwrap();
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        let out = tmp.path().join("out");

        let mut tar = TarWriter::new(Vec::new());
        tar.append(ArchiveEntry::<&[u8]>::directory("/root".into(), 0o755, 0))
            .unwrap();
        tar.append(ArchiveEntry::<&[u8]>::symlink("/root/link".into(), outside.clone(), 0o777, 0))
            .unwrap();
        tar.append(ArchiveEntry::file("/root/link/pwned".into(), 0o644, 0, 4, &b"evil"[..]))
            .unwrap();
        let archive = tar.finish().unwrap();

        let mut extractor = Extractor::new(&out, &NoopLogger, &CancelToken::new());
        let err = extractor.extract_archive(&archive[..]).unwrap_err();
        assert!(matches!(
            crate::error::find_transfer_error(&err),
            Some(TransferError::InvalidEntryName { .. })
        ));
        assert!(!outside.join("pwned").exists());
        assert_eq!(fs::read_link(out.join("link")).unwrap(), outside);
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_symlink_is_replaced_not_followed() {
        let tmp = TempDir::new().unwrap();
        let victim = tmp.path().join("victim.txt");
        fs::write(&victim, "untouched").unwrap();
        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        std::os::unix::fs::symlink(&victim, out.join("a.txt")).unwrap();

        let archive = sample_archive();
        let mut extractor = Extractor::new(&out, &NoopLogger, &CancelToken::new());
        extractor.extract_archive(&archive[..]).unwrap();

        assert_eq!(fs::read_to_string(&victim).unwrap(), "untouched");
        assert!(fs::symlink_metadata(out.join("a.txt")).unwrap().is_file());
        assert_eq!(fs::read_to_string(out.join("a.txt")).unwrap(), "hi");
    }

    #[test]
    fn test_cancelled_extractor_stops() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let archive = sample_archive();
        let mut extractor = Extractor::new(tmp.path(), &NoopLogger, &cancel);
        let err = extractor.extract_archive(&archive[..]).unwrap_err();
        assert!(crate::error::is_cancelled(&err));
        assert_eq!(extractor.stats().entries, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_directory_mode_is_applied_last() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");

        let mut tar = TarWriter::new(Vec::new());
        tar.append(ArchiveEntry::<&[u8]>::directory("/root".into(), 0o755, 0))
            .unwrap();
        tar.append(ArchiveEntry::<&[u8]>::directory("/root/ro".into(), 0o555, 0))
            .unwrap();
        tar.append(ArchiveEntry::file("/root/ro/f".into(), 0o444, 0, 1, &b"x"[..]))
            .unwrap();
        let archive = tar.finish().unwrap();

        let mut extractor = Extractor::new(&out, &NoopLogger, &CancelToken::new());
        extractor.extract_archive(&archive[..]).unwrap();

        let mode = fs::metadata(out.join("ro")).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o555);
        assert_eq!(fs::read(out.join("ro/f")).unwrap(), b"x");

        // Let TempDir clean up.
        fs::set_permissions(out.join("ro"), fs::Permissions::from_mode(0o755)).unwrap();
    }
}
