//! Upload and download pipelines.
//!
//! ```text
//! upload:   walk+tar ──pipe──> compress ──pipe──> store.put   (caller thread)
//! download: store.get ──pipe──> decompress ──pipe──> untar+extract
//!           (caller thread)
//! ```
//!
//! Every stage owns the pipe ends it touches and closes them on exit:
//! cleanly on success, with an abort on failure. That is what guarantees a
//! failing stage unblocks its neighbours instead of deadlocking them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::archive::{EntryKind, TarWriter};
use crate::cancel::CancelToken;
use crate::codec::{CodecOptions, Compression};
use crate::extract::Extractor;
use crate::logger::Logger;
use crate::pipe::{pipe_with, PipeConfig, PipeReader, PipeWriter};
use crate::stage::{bridge, drain, settle, Stage};
use crate::store::{BlobStore, GetOptions, SequentialWriter};
use crate::walk::TreeWalker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

/// Counts for one directory transfer; `bytes` are uncompressed file bytes
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    pub entries: u64,
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

impl TransferStats {
    /// Stats for a plain object transfer of `bytes`
    pub fn single_file(bytes: u64) -> Self {
        TransferStats {
            entries: 1,
            files: 1,
            bytes,
            ..Default::default()
        }
    }

    pub(crate) fn record(&mut self, kind: &EntryKind, bytes: u64) {
        self.entries += 1;
        match kind {
            EntryKind::File => self.files += 1,
            EntryKind::Directory => self.directories += 1,
            EntryKind::Symlink(_) => self.symlinks += 1,
        }
        self.bytes += bytes;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    pub pipe: PipeConfig,
    pub codec: CodecOptions,
}

/// Everything a pipeline needs besides its source and destination
pub struct Pipeline<'a> {
    pub store: &'a dyn BlobStore,
    pub bucket: &'a str,
    pub options: PipelineOptions,
    pub logger: Arc<dyn Logger>,
    pub cancel: CancelToken,
}

impl Pipeline<'_> {
    /// Archive and compress `local_dir` straight into the object `key`.
    pub fn upload_directory(&self, local_dir: &Path, key: &str) -> Result<TransferStats> {
        let compression = Compression::from_key(key)?;
        let walker = TreeWalker::new(local_dir)?;
        let started = Instant::now();
        self.logger.start(Direction::Upload, local_dir, key);

        let (archive_rx, archive_tx) = pipe_with(&self.options.pipe, &self.cancel);
        let (mut body, body_tx) = pipe_with(&self.options.pipe, &self.cancel);

        let archive_stage = Stage::spawn("archive", {
            let cancel = self.cancel.clone();
            move || write_archive(&walker, archive_tx, &cancel)
        })?;
        let codec_options = self.options.codec;
        let codec_stage = bridge("compress", archive_rx, body_tx, move |input, output| {
            compression
                .encode(input, output, &codec_options)
                .map(|(n, _)| n)
        })?;

        let put = self
            .store
            .put(self.bucket, key, &mut body, &self.cancel)
            .with_context(|| format!("failed to upload {}/{}", self.bucket, key));
        // Anything still blocked upstream fails fast from here on.
        body.close();

        let compressed = codec_stage.join();
        let mut stats = TransferStats::default();
        let archived = archive_stage.join().map(|s| stats = s);

        let outcome = settle(
            &self.cancel,
            vec![
                ("put", put.map(|_| ())),
                ("compress", compressed.map(|_| ())),
                ("archive", archived),
            ],
        );
        self.finish(Direction::Upload, local_dir, outcome, stats, started)
    }

    /// Stream the object `key` through decompression and extraction into
    /// `local_dir`. The download is forced to one sequential stream because
    /// a pipe cannot take writes at arbitrary offsets.
    pub fn download_directory(&self, key: &str, local_dir: &Path) -> Result<TransferStats> {
        let compression = Compression::from_key(key)?;
        let started = Instant::now();
        self.logger.start(Direction::Download, local_dir, key);

        let (body_rx, body_tx) = pipe_with(&self.options.pipe, &self.cancel);
        let (archive_rx, archive_tx) = pipe_with(&self.options.pipe, &self.cancel);

        let codec_stage = bridge("decompress", body_rx, archive_tx, move |input, output| {
            compression.decode(input, output)
        })?;
        let extract_stage = Stage::spawn("extract", {
            let target = local_dir.to_path_buf();
            let logger = Arc::clone(&self.logger);
            let cancel = self.cancel.clone();
            move || extract_stream(archive_rx, &target, &*logger, &cancel)
        })?;

        let mut sink = SequentialWriter::new(body_tx);
        let got = self
            .store
            .get(self.bucket, key, &mut sink, &GetOptions::sequential(), &self.cancel)
            .with_context(|| format!("failed to download {}/{}", self.bucket, key));
        let mut body_tx = sink.into_inner();
        let got = match got {
            Ok(_) => body_tx
                .close()
                .context("failed to finish download stream"),
            Err(err) => {
                body_tx.abort(format!("{err:#}"));
                Err(err)
            }
        };

        let decompressed = codec_stage.join();
        let mut stats = TransferStats::default();
        let extracted = extract_stage.join().map(|s| stats = s);

        let outcome = settle(
            &self.cancel,
            vec![
                ("get", got),
                ("decompress", decompressed.map(|_| ())),
                ("extract", extracted),
            ],
        );
        self.finish(Direction::Download, local_dir, outcome, stats, started)
    }

    fn finish(
        &self,
        direction: Direction,
        local_dir: &Path,
        outcome: Result<()>,
        stats: TransferStats,
        started: Instant,
    ) -> Result<TransferStats> {
        match outcome {
            Ok(()) => {
                self.logger
                    .done(direction, &stats, started.elapsed().as_secs_f64());
                Ok(stats)
            }
            Err(err) => {
                self.logger
                    .error(&direction.to_string(), local_dir, &format!("{err:#}"));
                Err(err)
            }
        }
    }
}

/// Archive stage: walk the tree into a tar stream on `writer`
fn write_archive(
    walker: &TreeWalker,
    mut writer: PipeWriter,
    cancel: &CancelToken,
) -> Result<TransferStats> {
    let result = (|| -> Result<TransferStats> {
        let mut stats = TransferStats::default();
        let mut tar = TarWriter::new(&mut writer);
        for entry in walker.entries() {
            cancel.check()?;
            let entry = entry?;
            let kind = entry.kind.clone();
            let bytes = tar.append(entry)?;
            stats.record(&kind, bytes);
        }
        tar.finish()?;
        Ok(stats)
    })();

    match result {
        Ok(stats) => {
            writer.close().context("failed to close archive stream")?;
            Ok(stats)
        }
        Err(err) => {
            writer.abort(format!("{err:#}"));
            Err(err)
        }
    }
}

/// Extract stage: untar from `reader` under `target`
fn extract_stream(
    mut reader: PipeReader,
    target: &Path,
    logger: &dyn Logger,
    cancel: &CancelToken,
) -> Result<TransferStats> {
    let mut extractor = Extractor::new(target, logger, cancel);
    let result = extractor
        .extract_archive(&mut reader)
        .and_then(|rest| drain(rest).context("failed to drain archive trailer"));
    if result.is_err() {
        reader.close();
    }
    result.map(|_| extractor.into_stats())
}
