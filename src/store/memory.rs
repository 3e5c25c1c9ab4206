//! In-process blob store, used by tests and embedders that need no disk.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;

use super::{parts, BlobStore, GetOptions, WriteAt};
use crate::cancel::CancelToken;
use crate::error::TransferError;

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn insert(&self, bucket: &str, key: &str, data: Vec<u8>) {
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), data);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let mut data = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            cancel.check()?;
            let n = body.read(&mut buf).context("failed to read upload body")?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        cancel.check()?;
        let len = data.len() as u64;
        self.insert(bucket, key, data);
        Ok(len)
    }

    /// Parts are always delivered in order, whatever the concurrency.
    fn get(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut dyn WriteAt,
        options: &GetOptions,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let data = self.object(bucket, key).ok_or_else(|| TransferError::NoSuchKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        for (offset, len) in parts(data.len() as u64, options.part_size) {
            cancel.check()?;
            let start = offset as usize;
            sink.write_all_at(&data[start..start + len], offset)
                .context("failed to write downloaded data")?;
        }
        Ok(data.len() as u64)
    }
}
