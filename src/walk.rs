//! Directory walker producing archive entries in deterministic pre-order

use anyhow::{Context, Result};
use std::fs::{self, File, Metadata};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::archive::{ArchiveEntry, SEPARATOR};
use crate::error::TransferError;

/// Walks `root` and names every node relative to `base`.
///
/// By default `base` is the parent of `root`, so the first segment of every
/// entry name is the root directory's own name (`/photos`, `/photos/a.jpg`).
#[derive(Debug, Clone)]
pub struct TreeWalker {
    root: PathBuf,
    base: PathBuf,
}

impl TreeWalker {
    pub fn new(root: &Path) -> Result<Self> {
        let root = fs::canonicalize(root)
            .with_context(|| format!("failed to resolve {}", root.display()))?;
        let base = root.parent().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
        Ok(TreeWalker { root, base })
    }

    /// Walk `root` with names relative to an explicit `base`
    pub fn with_base(root: impl Into<PathBuf>, base: impl Into<PathBuf>) -> Self {
        TreeWalker {
            root: root.into(),
            base: base.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily yields entries; regular files come with an open handle.
    /// The first error ends the walk.
    pub fn entries(&self) -> Entries {
        Entries {
            inner: WalkDir::new(&self.root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter(),
            base: self.base.clone(),
            failed: false,
        }
    }
}

pub struct Entries {
    inner: walkdir::IntoIter,
    base: PathBuf,
    failed: bool,
}

impl Iterator for Entries {
    type Item = Result<ArchiveEntry<File>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let result = match self.inner.next()? {
                Ok(dent) => to_archive_entry(&self.base, dent.path()),
                Err(err) => Err(anyhow::Error::new(err).context("failed to walk directory")),
            };
            match result {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Slash-separated name of `path` relative to `base`, with one leading
/// separator. A node that collapses to nothing is an error.
pub fn archive_name(base: &Path, path: &Path) -> Result<String, TransferError> {
    let unexpected = || TransferError::UnexpectedPath {
        path: path.to_path_buf(),
    };
    let relative = path.strip_prefix(base).map_err(|_| unexpected())?;

    let mut name = String::new();
    for component in relative.components() {
        if let Component::Normal(segment) = component {
            name.push(SEPARATOR);
            name.push_str(&segment.to_string_lossy());
        }
    }
    if name.is_empty() {
        return Err(unexpected());
    }
    Ok(name)
}

/// `None` for node types the archive has no room for (sockets, fifos, ...)
fn to_archive_entry(base: &Path, path: &Path) -> Result<Option<ArchiveEntry<File>>> {
    let name = archive_name(base, path)?;
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let mode = mode_bits(&meta);
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let file_type = meta.file_type();
    let entry = if file_type.is_dir() {
        ArchiveEntry::directory(name, mode, mtime)
    } else if file_type.is_file() {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        ArchiveEntry::file(name, mode, mtime, meta.len(), file)
    } else if file_type.is_symlink() {
        let target = fs::read_link(path)
            .with_context(|| format!("failed to read link {}", path.display()))?;
        ArchiveEntry::symlink(name, target, mode, mtime)
    } else {
        return Ok(None);
    };
    Ok(Some(entry))
}

#[cfg(unix)]
fn mode_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}
