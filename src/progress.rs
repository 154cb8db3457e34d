//! Transfer progress arithmetic and a cargo-style terminal display
//!
//! - Finished transfers and errors scroll above
//! - The spinner line at the bottom shows the transfer currently moving

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::logger::Logger;
use crate::model::{FileKey, LivenessState, LoadingData, LoadingKind};

/// `percentage` never reaches 100 before the transfer is confirmed; a
/// zero-byte transfer reports 1%.
pub fn loading_data(kind: LoadingKind, done: u64, total: u64, elapsed: Duration) -> LoadingData {
    let percentage = if total == 0 {
        1
    } else {
        ((done as f64 / total as f64 * 100.0).round() as u64).min(99) as u8
    };
    let secs = elapsed.as_secs_f64();
    let bytes_per_second = if secs > 0.0 { done as f64 / secs } else { 0.0 };
    let seconds_until_finish = if bytes_per_second > 0.0 {
        total as f64 / bytes_per_second
    } else {
        -1.0
    };
    LoadingData {
        kind,
        percentage,
        bytes_per_second,
        seconds_until_finish,
    }
}

/// Clock for one stream; turns byte counts into [`LoadingData`]
#[derive(Debug, Clone, Copy)]
pub struct ProgressMeter {
    kind: LoadingKind,
    started: Instant,
}

impl ProgressMeter {
    pub fn start(kind: LoadingKind) -> Self {
        Self {
            kind,
            started: Instant::now(),
        }
    }

    pub fn sample(&self, done: u64, total: u64) -> LoadingData {
        loading_data(self.kind, done, total, self.started.elapsed())
    }
}

fn verb(kind: LoadingKind) -> &'static str {
    match kind {
        LoadingKind::Upload => "Uploading",
        LoadingKind::Download => "Downloading",
        LoadingKind::SyncDownload => "Fetching",
        LoadingKind::SyncUpload => "Syncing",
    }
}

/// Spinner-based [`Logger`] for the CLI
pub struct CargoProgress {
    spinner: ProgressBar,
    start_time: Instant,
    show_files: bool,
}

impl CargoProgress {
    pub fn new(verbose: bool) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self {
            spinner,
            start_time: Instant::now(),
            show_files: verbose,
        }
    }

    fn print_line(&self, label: &str, color: Color, text: &str) {
        self.spinner.suspend(|| {
            println!("  {} {}", label.with(color).bold(), text.with(Color::Cyan));
        });
    }

    pub fn set_status(&self, stage: &str) {
        self.spinner.set_message(format!(
            "{} in {:.1}s",
            stage.with(Color::Green).bold(),
            self.start_time.elapsed().as_secs_f64()
        ));
    }

    pub fn finish(&self, completed: usize, failed: usize) {
        let label = if failed == 0 {
            "Completed".with(Color::Green).bold()
        } else {
            "Finished".with(Color::Yellow).bold()
        };
        self.spinner.finish_with_message(format!(
            "{} {} task(s), {} failed, in {:.1}s",
            label,
            completed + failed,
            failed,
            self.start_time.elapsed().as_secs_f64()
        ));
    }
}

impl Logger for CargoProgress {
    fn liveness(&self, node: &str, _from: LivenessState, to: LivenessState) {
        if self.show_files {
            self.print_line("Node", Color::Blue, &format!("{node} is {to}"));
        }
    }

    fn placement_added(&self, node: &str, key: &FileKey) {
        if self.show_files {
            self.print_line("Found", Color::Green, &format!("{} on {node}", key.full_path()));
        }
    }

    fn placement_removed(&self, node: &str, key: &FileKey) {
        if self.show_files {
            self.print_line("Gone", Color::Yellow, &format!("{} on {node}", key.full_path()));
        }
    }

    fn progress(&self, node: &str, key: &FileKey, loading: &LoadingData) {
        let eta = if loading.seconds_until_finish < 0.0 {
            "--".to_string()
        } else {
            format!("{:.0}s", loading.seconds_until_finish)
        };
        self.spinner.set_message(format!(
            "{} {} -> {} {:>3}% @ {:.1} MB/s (eta {})",
            verb(loading.kind).with(Color::Green).bold(),
            key.full_path(),
            node,
            loading.percentage,
            loading.bytes_per_second / 1_048_576.0,
            eta
        ));
    }

    fn transfer_done(&self, node: &str, key: &FileKey, bytes: u64) {
        self.print_line(
            "Transferred",
            Color::Green,
            &format!("{} -> {node} ({:.1} MB)", key.full_path(), bytes as f64 / 1_048_576.0),
        );
    }

    fn error(&self, context: &str, subject: &str, msg: &str) {
        self.spinner.suspend(|| {
            eprintln!("  {} {context} {subject}: {msg}", "Failed".with(Color::Red).bold());
        });
    }
}
