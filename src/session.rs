//! Transfer session: the public entry point tying a blob store, a bucket
//! and a logger to the pipelines.
//!
//! Blocking transfers register their cancellation scope in a single slot so
//! `Session::cancel` (typically from a signal handler) can stop whichever
//! one is in flight. Starting a second blocking transfer replaces the slot;
//! use `spawn_upload`/`spawn_download` to get an independent handle per
//! transfer instead.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::cancel::CancelToken;
use crate::credentials::{CredentialProvider, Credentials};
use crate::error::TransferError;
use crate::logger::{Logger, NoopLogger};
use crate::stage::Stage;
use crate::store::{BlobStore, GetOptions};
use crate::transfer::{Direction, Pipeline, PipelineOptions, TransferStats};

pub struct Session {
    store: Arc<dyn BlobStore>,
    bucket: String,
    credentials: Option<Arc<dyn CredentialProvider>>,
    logger: Arc<dyn Logger>,
    options: PipelineOptions,
    cancel_slot: Mutex<Option<CancelToken>>,
}

/// Holds the slot for one blocking call and releases it on every exit path
struct Scope<'a> {
    slot: &'a Mutex<Option<CancelToken>>,
    token: CancelToken,
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        // A newer transfer may own the slot by now; leave it alone then.
        if slot.as_ref().is_some_and(|t| t.same_scope(&self.token)) {
            *slot = None;
        }
    }
}

impl Session {
    pub fn new(store: Arc<dyn BlobStore>, bucket: impl Into<String>) -> Self {
        Session {
            store,
            bucket: bucket.into(),
            credentials: None,
            logger: Arc::new(NoopLogger),
            options: PipelineOptions::default(),
            cancel_slot: Mutex::new(None),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    fn begin(&self) -> Scope<'_> {
        let token = CancelToken::new();
        *self.cancel_slot.lock() = Some(token.clone());
        Scope {
            slot: &self.cancel_slot,
            token,
        }
    }

    fn pipeline(&self, cancel: CancelToken) -> Pipeline<'_> {
        Pipeline {
            store: &*self.store,
            bucket: &self.bucket,
            options: self.options,
            logger: Arc::clone(&self.logger),
            cancel,
        }
    }

    /// Cancel the blocking transfer currently registered, if any. Safe to
    /// call from any thread, at any time, any number of times.
    pub fn cancel(&self) {
        if let Some(token) = self.cancel_slot.lock().take() {
            token.cancel();
        }
    }

    pub fn upload_directory(&self, local_dir: &Path, key: &str) -> Result<TransferStats> {
        let scope = self.begin();
        self.pipeline(scope.token.clone())
            .upload_directory(local_dir, key)
    }

    pub fn download_directory(&self, key: &str, local_dir: &Path) -> Result<TransferStats> {
        let scope = self.begin();
        self.pipeline(scope.token.clone())
            .download_directory(key, local_dir)
    }

    /// Store one local file verbatim under `key`.
    pub fn upload_file(&self, local: &Path, key: &str) -> Result<u64> {
        let scope = self.begin();
        let started = Instant::now();
        self.logger.start(Direction::Upload, local, key);
        let mut file =
            File::open(local).with_context(|| format!("failed to open {}", local.display()))?;
        let stored = self
            .store
            .put(&self.bucket, key, &mut file, &scope.token)
            .with_context(|| format!("failed to upload {}/{}", self.bucket, key))?;
        self.logger.done(
            Direction::Upload,
            &TransferStats::single_file(stored),
            started.elapsed().as_secs_f64(),
        );
        Ok(stored)
    }

    /// Fetch `key` into a local file. The file takes writes at any offset,
    /// so parts may be fetched in parallel.
    pub fn download_file(&self, key: &str, local: &Path) -> Result<u64> {
        let scope = self.begin();
        let started = Instant::now();
        self.logger.start(Direction::Download, local, key);
        let mut file = File::create(local)
            .with_context(|| format!("failed to create {}", local.display()))?;
        let fetched = self
            .store
            .get(&self.bucket, key, &mut file, &GetOptions::default(), &scope.token)
            .with_context(|| format!("failed to download {}/{}", self.bucket, key))?;
        self.logger.done(
            Direction::Download,
            &TransferStats::single_file(fetched),
            started.elapsed().as_secs_f64(),
        );
        Ok(fetched)
    }

    /// Resolve credentials from the configured provider, cancellable like a
    /// transfer.
    pub fn credentials(&self) -> Result<Credentials> {
        let provider = self
            .credentials
            .as_ref()
            .ok_or(TransferError::MissingConfig {
                field: "credentials",
            })?;
        let scope = self.begin();
        provider.resolve(&scope.token)
    }

    /// Start an upload on its own thread with its own cancellation scope.
    pub fn spawn_upload(
        self: &Arc<Self>,
        local_dir: impl Into<PathBuf>,
        key: impl Into<String>,
    ) -> Result<TransferHandle> {
        let (local_dir, key) = (local_dir.into(), key.into());
        self.spawn("upload", move |pipeline| {
            pipeline.upload_directory(&local_dir, &key)
        })
    }

    /// Start a download on its own thread with its own cancellation scope.
    pub fn spawn_download(
        self: &Arc<Self>,
        key: impl Into<String>,
        local_dir: impl Into<PathBuf>,
    ) -> Result<TransferHandle> {
        let (key, local_dir) = (key.into(), local_dir.into());
        self.spawn("download", move |pipeline| {
            pipeline.download_directory(&key, &local_dir)
        })
    }

    fn spawn<F>(self: &Arc<Self>, name: &'static str, run: F) -> Result<TransferHandle>
    where
        F: FnOnce(Pipeline<'_>) -> Result<TransferStats> + Send + 'static,
    {
        let cancel = CancelToken::new();
        let session = Arc::clone(self);
        let token = cancel.clone();
        let stage = Stage::spawn(name, move || run(session.pipeline(token)))?;
        Ok(TransferHandle { cancel, stage })
    }
}

/// A transfer running in the background
pub struct TransferHandle {
    cancel: CancelToken,
    stage: Stage<TransferStats>,
}

impl TransferHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_finished()
    }

    pub fn join(self) -> Result<TransferStats> {
        self.stage.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::error::{find_transfer_error, is_cancelled};
    use crate::store::MemoryBlobStore;

    fn session() -> Session {
        Session::new(Arc::new(MemoryBlobStore::new()), "bucket")
    }

    #[test]
    fn test_slot_released_after_call() {
        let session = session();
        {
            let _scope = session.begin();
            assert!(session.cancel_slot.lock().is_some());
        }
        assert!(session.cancel_slot.lock().is_none());
        // Nothing in flight: harmless.
        session.cancel();
        session.cancel();
    }

    #[test]
    fn test_finishing_transfer_keeps_newer_scope() {
        let session = session();
        let first = session.begin();
        let second = session.begin();
        let first_token = first.token.clone();
        drop(first);
        assert!(session
            .cancel_slot
            .lock()
            .as_ref()
            .is_some_and(|t| t.same_scope(&second.token)));

        // Last writer wins: only the newest scope is reachable.
        session.cancel();
        assert!(second.token.is_cancelled());
        assert!(!first_token.is_cancelled());
    }

    #[test]
    fn test_credentials() {
        let err = session().credentials().unwrap_err();
        assert!(matches!(
            find_transfer_error(&err),
            Some(TransferError::MissingConfig { field: "credentials" })
        ));

        let session = session().with_credentials(Arc::new(StaticCredentials::new("id", "secret")));
        assert_eq!(session.credentials().unwrap().access_key_id, "id");
        assert!(session.cancel_slot.lock().is_none());
    }

    #[test]
    fn test_spawned_upload_can_be_cancelled() {
        let session = Arc::new(session());
        let tmp = tempfile::TempDir::new().unwrap();
        let handle = session.spawn_upload(tmp.path(), "never.xz").unwrap();
        handle.cancel();
        match handle.join() {
            // The tree is empty, so the upload may finish before noticing.
            Ok(stats) => assert_eq!(stats.files, 0),
            Err(err) => assert!(is_cancelled(&err)),
        }
    }
}
