//! treepipe - stream directory trees into and out of a blob store without
//! staging the archive on local disk.

mod cli;
mod progress;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use treepipe::config::SessionConfig;
use treepipe::error::is_cancelled;
use treepipe::log::{TransferLog, TransferLogEntry};
use treepipe::logger::{ConsoleLogger, Logger, NoopLogger, TextLogger};
use treepipe::{Direction, Session, TransferStats};

use crate::cli::{Args, Command};
use crate::progress::Spinner;

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::from_env(),
    };
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = Some(endpoint.clone());
    }
    if let Some(bucket) = &args.bucket {
        config.bucket = Some(bucket.clone());
    }

    // Choose logger once; NoopLogger keeps the stages free of logging cost
    let logger: Arc<dyn Logger> = if let Some(path) = &args.log_file {
        Arc::new(
            TextLogger::new(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?,
        )
    } else if args.verbose {
        Arc::new(ConsoleLogger)
    } else {
        Arc::new(NoopLogger)
    };
    let session = Arc::new(config.open()?.with_logger(logger));

    let handler_session = Arc::clone(&session);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, cancelling transfer...");
        handler_session.cancel();
    })
    .context("failed to install Ctrl-C handler")?;

    let (direction, key, local) = match &args.command {
        Command::Push { dir, key } => (Direction::Upload, key, dir),
        Command::Pull { key, dir } => (Direction::Download, key, dir),
        Command::Put { file, key } => (Direction::Upload, key, file),
        Command::Get { key, file } => (Direction::Download, key, file),
    };

    let journal = args.journal.as_ref().map(TransferLog::new);
    let started = TransferLogEntry::started(direction, session.bucket(), key, local);
    if let Some(journal) = &journal {
        journal.add_entry(&started)?;
    }

    // Verbose output and the spinner would fight over the terminal
    let spinner = (!args.verbose).then(|| Spinner::new(format!("{direction} {key}")));
    let outcome = run(&session, &args.command);

    if let Some(journal) = &journal {
        journal.add_entry(&started.finished(&outcome))?;
    }

    match outcome {
        Ok(stats) => {
            if let Some(spinner) = &spinner {
                spinner.finish_transfer(&stats);
            }
            Ok(())
        }
        Err(err) => {
            if let Some(spinner) = &spinner {
                spinner.finish_error(&err.to_string());
            }
            if is_cancelled(&err) {
                eprintln!("Transfer cancelled.");
                std::process::exit(130);
            }
            Err(err)
        }
    }
}

fn run(session: &Session, command: &Command) -> Result<TransferStats> {
    match command {
        Command::Push { dir, key } => session.upload_directory(dir, key),
        Command::Pull { key, dir } => session.download_directory(key, dir),
        Command::Put { file, key } => session
            .upload_file(file, key)
            .map(TransferStats::single_file),
        Command::Get { key, file } => session
            .download_file(key, file)
            .map(TransferStats::single_file),
    }
}
