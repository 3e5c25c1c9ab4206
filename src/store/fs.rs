//! Blob store backed by a local directory: `<root>/<bucket>/<key>`.
//!
//! Uploads go to a temporary file beside the destination and are renamed
//! into place only once the body has been read to a clean end, so readers
//! never observe a partial object.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use rayon::prelude::*;
use tempfile::NamedTempFile;

use super::{parts, BlobStore, GetOptions, WriteAt};
use crate::cancel::CancelToken;
use crate::error::TransferError;

const COPY_BUFFER: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsBlobStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of an object; bucket and key may not escape the root.
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, TransferError> {
        let mut path = self.root.clone();
        for value in [bucket, key] {
            let segments: Vec<&str> = value.split('/').filter(|s| !s.is_empty()).collect();
            let bad = segments.is_empty()
                || segments
                    .iter()
                    .any(|s| *s == "." || *s == ".." || s.contains('\\'));
            if bad {
                return Err(TransferError::InvalidKey {
                    key: format!("{bucket}/{key}"),
                });
            }
            path.extend(segments);
        }
        Ok(path)
    }

    pub fn exists(&self, bucket: &str, key: &str) -> bool {
        self.object_path(bucket, key)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    fn open_object(&self, bucket: &str, key: &str) -> Result<(PathBuf, File)> {
        let path = self.object_path(bucket, key)?;
        match File::open(&path) {
            Ok(file) => Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(TransferError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }
            .into()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("failed to open {}", path.display()))),
        }
    }

    fn get_sequential(
        file: &mut File,
        size: u64,
        sink: &mut dyn WriteAt,
        part_size: usize,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let mut buf = vec![0u8; part_size.min(COPY_BUFFER).max(1)];
        let mut offset = 0u64;
        while offset < size {
            cancel.check()?;
            let n = file.read(&mut buf).context("failed to read object")?;
            if n == 0 {
                break;
            }
            sink.write_all_at(&buf[..n], offset)
                .context("failed to write downloaded data")?;
            offset += n as u64;
        }
        Ok(offset)
    }

    /// Fetches parts on a rayon pool of `options.concurrency` threads while
    /// the calling thread writes them to `sink` as they arrive.
    fn get_parallel(
        path: &Path,
        size: u64,
        sink: &mut dyn WriteAt,
        options: &GetOptions,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let parts = parts(size, options.part_size);
        let workers = options.concurrency.min(parts.len()).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("treepipe-get-{i}"))
            .build()
            .context("failed to start download workers")?;
        let (tx, rx) = mpsc::sync_channel::<io::Result<(u64, Vec<u8>)>>(workers);

        let parts = &parts;
        pool.in_place_scope(|scope| -> Result<u64> {
            scope.spawn(move |_| {
                // A send fails once the receiver is gone; that ends the fetch.
                let _ = parts.par_iter().try_for_each_with(tx, |tx, &(offset, len)| {
                    if cancel.is_cancelled() {
                        return Err(());
                    }
                    let part = File::open(path)
                        .and_then(|mut file| read_part(&mut file, offset, len))
                        .map(|buf| (offset, buf));
                    tx.send(part).map_err(|_| ())
                });
            });

            // Owned here so an early return disconnects the workers before
            // the scope waits for them.
            let rx = rx;
            let mut written = 0u64;
            for part in rx {
                cancel.check()?;
                let (offset, buf) = part.context("failed to read object part")?;
                sink.write_all_at(&buf, offset)
                    .context("failed to write downloaded data")?;
                written += buf.len() as u64;
            }
            cancel.check()?;
            Ok(written)
        })
    }
}

fn read_part(file: &mut File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

impl BlobStore for FsBlobStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let path = self.object_path(bucket, key)?;
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let mut tmp = NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to stage upload in {}", parent.display()))?;
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut total = 0u64;
        loop {
            cancel.check()?;
            let n = body.read(&mut buf).context("failed to read upload body")?;
            if n == 0 {
                break;
            }
            tmp.write_all(&buf[..n])
                .context("failed to write staged upload")?;
            total += n as u64;
        }
        cancel.check()?;
        tmp.as_file().sync_all().context("failed to sync staged upload")?;
        tmp.persist(&path)
            .with_context(|| format!("failed to commit {}", path.display()))?;
        Ok(total)
    }

    fn get(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut dyn WriteAt,
        options: &GetOptions,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let (path, mut file) = self.open_object(bucket, key)?;
        let size = file
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();

        if options.concurrency <= 1 {
            Self::get_sequential(&mut file, size, sink, options.part_size, cancel)
        } else {
            drop(file);
            Self::get_parallel(&path, size, sink, options, cancel)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{find_transfer_error, is_cancelled};
    use crate::store::SequentialWriter;
    use tempfile::TempDir;

    #[test]
    fn test_object_path_stays_under_root() {
        let store = FsBlobStore::new("/srv/blobs");
        assert_eq!(
            store.object_path("bucket", "a/b.zstd").unwrap(),
            PathBuf::from("/srv/blobs/bucket/a/b.zstd")
        );
        for (bucket, key) in [("", "k"), ("b", ""), ("b", "../x"), ("..", "k"), ("b", "a/./c")] {
            assert!(store.object_path(bucket, key).is_err(), "{bucket}/{key}");
        }
    }

    #[test]
    fn test_put_then_get() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path());
        let cancel = CancelToken::new();
        let data: Vec<u8> = (0..700_000u32).map(|i| (i % 251) as u8).collect();

        let stored = store.put("b", "dir/obj", &mut &data[..], &cancel).unwrap();
        assert_eq!(stored, data.len() as u64);
        assert!(store.exists("b", "dir/obj"));

        let mut sink = SequentialWriter::new(Vec::new());
        let options = GetOptions {
            concurrency: 1,
            part_size: 64 * 1024,
        };
        store.get("b", "dir/obj", &mut sink, &options, &cancel).unwrap();
        assert_eq!(sink.into_inner(), data);
    }

    #[test]
    fn test_parallel_get_into_file() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path().join("blobs"));
        let cancel = CancelToken::new();
        let data: Vec<u8> = (0..300_001u32).map(|i| (i * 7 % 256) as u8).collect();
        store.put("b", "obj", &mut &data[..], &cancel).unwrap();

        let target = tmp.path().join("copy");
        let mut file = File::create(&target).unwrap();
        let options = GetOptions {
            concurrency: 4,
            part_size: 10_000,
        };
        let n = store.get("b", "obj", &mut file, &options, &cancel).unwrap();
        drop(file);
        assert_eq!(n, data.len() as u64);
        assert_eq!(fs::read(&target).unwrap(), data);
    }

    #[test]
    fn test_parallel_get_stops_on_sink_error() {
        struct Refusing;
        impl WriteAt for Refusing {
            fn write_all_at(&mut self, _: &[u8], _: u64) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            }
        }

        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path());
        let cancel = CancelToken::new();
        store.put("b", "obj", &mut &vec![7u8; 500_000][..], &cancel).unwrap();

        let options = GetOptions {
            concurrency: 3,
            part_size: 4096,
        };
        let err = store
            .get("b", "obj", &mut Refusing, &options, &cancel)
            .unwrap_err();
        assert!(format!("{err:#}").contains("disk full"));
    }

    #[test]
    fn test_failed_put_leaves_no_object() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "network down"))
            }
        }

        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path());
        assert!(store.put("b", "obj", &mut Failing, &CancelToken::new()).is_err());
        assert!(!store.exists("b", "obj"));
        assert_eq!(fs::read_dir(tmp.path().join("b")).unwrap().count(), 0);

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = store.put("b", "obj", &mut &b"data"[..], &cancel).unwrap_err();
        assert!(is_cancelled(&err));
        assert!(!store.exists("b", "obj"));
    }

    #[test]
    fn test_missing_key() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path());
        let mut sink = SequentialWriter::new(Vec::new());
        let err = store
            .get("b", "nope", &mut sink, &GetOptions::sequential(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(
            find_transfer_error(&err),
            Some(TransferError::NoSuchKey { .. })
        ));
    }
}
