//! Remote transfer endpoint: the blob store the pipelines talk to.

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use anyhow::Result;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::cancel::CancelToken;
use crate::error::TransferError;

/// Default size of one ranged part on download
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Put/get of whole objects addressed by `(bucket, key)`.
///
/// Both calls must return promptly once `cancel` fires, and must never
/// leave a partially written object behind on a failed `put`.
pub trait BlobStore: Send + Sync {
    /// Store everything readable from `body` under `key`. Returns bytes stored.
    fn put(&self, bucket: &str, key: &str, body: &mut dyn Read, cancel: &CancelToken)
        -> Result<u64>;

    /// Write the object into `sink`. With `options.concurrency > 1` parts
    /// may arrive in any order.
    fn get(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut dyn WriteAt,
        options: &GetOptions,
        cancel: &CancelToken,
    ) -> Result<u64>;
}

#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    /// Parts fetched in parallel
    pub concurrency: usize,
    pub part_size: usize,
}

impl Default for GetOptions {
    fn default() -> Self {
        GetOptions {
            concurrency: 4,
            part_size: DEFAULT_PART_SIZE,
        }
    }
}

impl GetOptions {
    /// One part at a time, in order; required when the sink is a pipe.
    pub fn sequential() -> Self {
        GetOptions {
            concurrency: 1,
            ..Default::default()
        }
    }
}

/// Destination that accepts writes at explicit offsets
pub trait WriteAt {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;
}

impl WriteAt for File {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }
}

/// Adapts a plain stream to `WriteAt`, insisting that every write starts
/// exactly where the previous one ended.
pub struct SequentialWriter<W> {
    inner: W,
    offset: u64,
}

impl<W: Write> SequentialWriter<W> {
    pub fn new(inner: W) -> Self {
        SequentialWriter { inner, offset: 0 }
    }

    pub fn position(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> WriteAt for SequentialWriter<W> {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        if offset != self.offset {
            return Err(TransferError::NonSequentialWrite {
                expected: self.offset,
                got: offset,
            }
            .into());
        }
        self.inner.write_all(buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }
}

/// Byte ranges `[offset, offset + len)` covering `size` bytes
pub(crate) fn parts(size: u64, part_size: usize) -> Vec<(u64, usize)> {
    let part_size = part_size.max(1) as u64;
    (0..size)
        .step_by(part_size as usize)
        .map(|offset| (offset, (size - offset).min(part_size) as usize))
        .collect()
}
