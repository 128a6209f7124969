//! Transfer progress display with progress bars.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use peerdrop_core::TransferProgress;
use std::collections::HashMap;

const BAR_TEMPLATE: &str =
    "{msg:>14} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// One progress bar per receiving peer
pub struct TransferBars {
    multi: MultiProgress,
    total_bytes: u64,
    bars: HashMap<String, ProgressBar>,
}

impl TransferBars {
    /// Create bars for a transfer of `total_bytes`
    #[must_use]
    pub fn new(total_bytes: u64) -> Self {
        Self {
            multi: MultiProgress::new(),
            total_bytes,
            bars: HashMap::new(),
        }
    }

    fn bar(&mut self, label: &str) -> ProgressBar {
        let multi = &self.multi;
        let total = self.total_bytes;
        self.bars.entry(label.to_string()).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(total));
            if let Ok(style) = ProgressStyle::default_bar().template(BAR_TEMPLATE) {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar.set_message(label.to_string());
            bar
        })
        .clone()
    }

    /// Apply a progress event
    pub fn update(&mut self, progress: &TransferProgress) {
        let bar = self.bar(progress.peer.short());
        bar.set_position(progress.bytes);
    }

    /// Show a note on a peer's bar
    pub fn note(&mut self, label: &str, note: &str) {
        let bar = self.bar(label);
        bar.set_message(format!("{label} {note}"));
    }

    /// Finish a peer's bar with a message
    pub fn finish(&mut self, label: &str, message: String) {
        let bar = self.bar(label);
        bar.set_position(self.total_bytes);
        bar.finish_with_message(message);
    }

    /// Abandon every unfinished bar (for errors)
    pub fn abandon(&self) {
        for bar in self.bars.values() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }
}

/// Format bytes in human-readable format
///
/// # Example
///
/// ```ignore
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
/// ```
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}
