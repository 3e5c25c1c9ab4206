//! Session configuration from the environment or a TOML file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{CodecOptions, DEFAULT_XZ_PRESET, DEFAULT_ZSTD_LEVEL};
use crate::credentials::{Credentials, CredentialProvider, EnvCredentials, StaticCredentials};
use crate::error::TransferError;
use crate::pipe::PipeConfig;
use crate::session::Session;
use crate::store::FsBlobStore;
use crate::transfer::PipelineOptions;

pub const ENV_ENDPOINT: &str = "TREEPIPE_ENDPOINT";
pub const ENV_REGION: &str = "TREEPIPE_REGION";
pub const ENV_BUCKET: &str = "TREEPIPE_BUCKET";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Root directory of the blob store
    pub endpoint: Option<PathBuf>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub transfer: TransferOptions,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    pub chunk_size: usize,
    pub pipe_depth: usize,
    pub zstd_level: i32,
    pub xz_preset: u32,
}

impl Default for TransferOptions {
    fn default() -> Self {
        let pipe = PipeConfig::default();
        TransferOptions {
            chunk_size: pipe.chunk_size,
            pipe_depth: pipe.depth,
            zstd_level: DEFAULT_ZSTD_LEVEL,
            xz_preset: DEFAULT_XZ_PRESET,
        }
    }
}

impl From<TransferOptions> for PipelineOptions {
    fn from(options: TransferOptions) -> Self {
        PipelineOptions {
            pipe: PipeConfig {
                chunk_size: options.chunk_size,
                depth: options.pipe_depth,
            },
            codec: CodecOptions {
                zstd_level: options.zstd_level,
                xz_preset: options.xz_preset,
            },
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

impl SessionConfig {
    /// Endpoint, region and bucket from `TREEPIPE_*`. Credentials are left
    /// unset; the opened session reads them from the environment on demand.
    pub fn from_env() -> Self {
        SessionConfig {
            endpoint: non_empty_var(ENV_ENDPOINT).map(PathBuf::from),
            region: non_empty_var(ENV_REGION),
            bucket: non_empty_var(ENV_BUCKET),
            credentials: None,
            transfer: TransferOptions::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn open(&self) -> Result<Session> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or(TransferError::MissingConfig { field: "endpoint" })?;
        let bucket = self
            .bucket
            .as_ref()
            .ok_or(TransferError::MissingConfig { field: "bucket" })?;

        let credentials: Arc<dyn CredentialProvider> = match &self.credentials {
            Some(credentials) => Arc::new(StaticCredentials::from(credentials.clone())),
            None => Arc::new(EnvCredentials),
        };
        Ok(
            Session::new(Arc::new(FsBlobStore::new(endpoint)), bucket.as_str())
                .with_options(self.transfer.into())
                .with_credentials(credentials),
        )
    }
}
