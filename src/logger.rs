use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::transfer::{Direction, TransferStats};

/// Operation hooks called from the pipeline stages. Every method has a
/// no-op default so implementations only override what they record.
pub trait Logger: Send + Sync {
    fn start(&self, _direction: Direction, _local: &Path, _key: &str) {}
    fn mkdir(&self, _path: &Path) {}
    fn entry(&self, _name: &str, _local: &Path) {}
    fn error(&self, _context: &str, _path: &Path, _msg: &str) {}
    fn done(&self, _direction: Direction, _stats: &TransferStats, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Appends timestamped lines to a file
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn start(&self, direction: Direction, local: &Path, key: &str) {
        self.line(&format!(
            "START op={} local={} key={}",
            direction,
            local.display(),
            key
        ));
    }
    fn mkdir(&self, path: &Path) {
        self.line(&format!("MKDIR path={}", path.display()));
    }
    fn entry(&self, name: &str, local: &Path) {
        self.line(&format!("ENTRY name={} local={}", name, local.display()));
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path.display(), msg));
    }
    fn done(&self, direction: Direction, stats: &TransferStats, seconds: f64) {
        self.line(&format!(
            "DONE op={direction} entries={} bytes={} seconds={seconds:.3}",
            stats.entries, stats.bytes
        ));
    }
}

/// Human-readable progress on stderr, used by the CLI in verbose mode
pub struct ConsoleLogger;

impl Logger for ConsoleLogger {
    fn mkdir(&self, path: &Path) {
        eprintln!("Creating directory: {}", path.display());
    }
    fn entry(&self, name: &str, local: &Path) {
        eprintln!("{} -> {}", name, local.display());
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        eprintln!("{}: {}: {}", context, path.display(), msg);
    }
}
