//! Command-line definitions for the `treepipe` binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stream directory trees to and from a blob store as compressed tar archives"
)]
pub struct Args {
    /// TOML session config (defaults to TREEPIPE_* environment variables)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Blob store root directory, overrides the config
    #[arg(long, global = true)]
    pub endpoint: Option<PathBuf>,

    /// Bucket name, overrides the config
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Append operation log lines to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// Record each transfer in this JSONL journal
    #[arg(long, global = true)]
    pub journal: Option<PathBuf>,

    /// Print every directory and file as it is extracted
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Archive a directory into KEY (.xz or .zstd)
    Push { dir: PathBuf, key: String },
    /// Extract KEY into a directory
    Pull { key: String, dir: PathBuf },
    /// Upload a single file as-is
    Put { file: PathBuf, key: String },
    /// Download a single object as-is
    Get { key: String, file: PathBuf },
}
