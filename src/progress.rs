//! Terminal progress bars for scans.
//!
//! [`Progress`] is a [`ScanListener`] that shows a spinner while roots are
//! collected and a bar for each hashing phase.

use std::sync::Mutex;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::duplicates::{ScanListener, ScanPhase, ScanResult};
use crate::scanner::ScanError;
use crate::tasks::lock_unpoisoned;

/// Progress reporter using indicatif.
pub struct Progress {
    multi: MultiProgress,
    bar: Mutex<Option<ProgressBar>>,
    quiet: bool,
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("quiet", &self.quiet)
            .finish_non_exhaustive()
    }
}

impl Progress {
    /// Create a reporter; a quiet reporter draws nothing.
    ///
    /// ```
    /// use netdupe::progress::Progress;
    ///
    /// let progress = Progress::new(true);
    /// ```
    #[must_use]
    pub fn new(quiet: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            bar: Mutex::new(None),
            quiet,
        }
    }

    fn collecting_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.green} {prefix} [{elapsed_precise}] {pos} files {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
    }

    fn hashing_style() -> ProgressStyle {
        ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg} (ETA: {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█>-")
    }

    fn finish_current(&self) {
        if let Some(bar) = lock_unpoisoned(&self.bar).take() {
            bar.finish_and_clear();
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Some(bar) = lock_unpoisoned(&self.bar).as_ref() {
            f(bar);
        }
    }
}

impl ScanListener for Progress {
    fn on_phase_changed(&self, phase: ScanPhase) {
        if self.quiet {
            return;
        }
        self.finish_current();

        let bar = match phase {
            ScanPhase::Collecting => {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(Self::collecting_style());
                bar.enable_steady_tick(Duration::from_millis(100));
                bar
            }
            ScanPhase::QuickHashing | ScanPhase::FullHashing => {
                let bar = self.multi.add(ProgressBar::new(0));
                bar.set_style(Self::hashing_style());
                bar
            }
            _ => return,
        };
        bar.set_prefix(phase.name().to_string());
        *lock_unpoisoned(&self.bar) = Some(bar);
    }

    fn on_progress(&self, processed: usize, total: usize, _percent: f64) {
        self.with_bar(|bar| {
            if total > 0 {
                bar.set_length(total as u64);
            }
            bar.set_position(processed as u64);
        });
    }

    fn on_speed(&self, files_per_second: f64, active_workers: usize) {
        self.with_bar(|bar| {
            bar.set_message(format!("{files_per_second:.0} files/s, {active_workers} busy"));
        });
    }

    fn on_error(&self, error: &ScanError) {
        if !self.quiet {
            let _ = self.multi.println(format!("warning: {error}"));
        }
    }

    fn on_completed(&self, _result: &ScanResult) {
        self.finish_current();
    }

    fn on_failed(&self, _reason: &str) {
        self.finish_current();
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.finish_current();
    }
}
