//! Activity spinner shown on stderr while a transfer runs

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use treepipe::TransferStats;

pub struct Spinner {
    spinner: ProgressBar,
    start_time: Instant,
}

impl Spinner {
    pub fn new(msg: String) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner:.green} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
        );
        spinner.set_message(msg);
        spinner.enable_steady_tick(Duration::from_millis(120));

        Self {
            spinner,
            start_time: Instant::now(),
        }
    }

    pub fn finish_transfer(&self, stats: &TransferStats) {
        let secs = self.start_time.elapsed().as_secs_f64();
        self.spinner.finish_with_message(format!(
            "{} entries ({} files, {:.1} MB) in {:.1}s",
            stats.entries,
            stats.files,
            stats.bytes as f64 / 1_048_576.0,
            secs
        ));
    }

    pub fn finish_error(&self, msg: &str) {
        self.spinner.abandon_with_message(format!("failed: {msg}"));
    }
}
