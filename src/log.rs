//! Append-only JSONL journal of directory transfers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::is_cancelled;
use crate::transfer::{Direction, TransferStats};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferLogEntry {
    pub timestamp: DateTime<Utc>,
    pub transfer_id: Uuid,
    pub direction: Direction,
    pub bucket: String,
    pub key: String,
    pub local: PathBuf,
    pub status: TransferStatus,
    pub entries: u64,
    pub bytes: u64,
    pub error: Option<String>,
}

impl TransferLogEntry {
    pub fn started(direction: Direction, bucket: &str, key: &str, local: &Path) -> Self {
        TransferLogEntry {
            timestamp: Utc::now(),
            transfer_id: Uuid::new_v4(),
            direction,
            bucket: bucket.to_string(),
            key: key.to_string(),
            local: local.to_path_buf(),
            status: TransferStatus::InProgress,
            entries: 0,
            bytes: 0,
            error: None,
        }
    }

    /// The terminal record for the same transfer
    pub fn finished(&self, outcome: &Result<TransferStats>) -> Self {
        let mut entry = self.clone();
        entry.timestamp = Utc::now();
        match outcome {
            Ok(stats) => {
                entry.status = TransferStatus::Completed;
                entry.entries = stats.entries;
                entry.bytes = stats.bytes;
            }
            Err(err) => {
                entry.status = if is_cancelled(err) {
                    TransferStatus::Cancelled
                } else {
                    TransferStatus::Failed
                };
                entry.error = Some(format!("{err:#}"));
            }
        }
        entry
    }
}

pub struct TransferLog {
    log_file_path: PathBuf,
}

impl TransferLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TransferLog {
            log_file_path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .with_context(|| format!("failed to open journal {}", self.log_file_path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path).with_context(|| {
            format!("failed to open journal {}", self.log_file_path.display())
        })?;
        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line)
                .with_context(|| format!("bad journal line {}", n + 1))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
