//! Terminal progress for running jobs.

use std::time::Duration;

use adaptcrawl_core::ProgressReporter;
use adaptcrawl_shared::{JobPhase, JobSummary};
use indicatif::{ProgressBar, ProgressStyle};

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// CLI progress reporter using an indicatif spinner.
pub(crate) struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    pub(crate) fn new() -> Self {
        let style = ProgressStyle::with_template("{spinner:.cyan} [{elapsed}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    /// Stop the spinner without waiting for a `done` callback.
    pub(crate) fn clear(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, job: &str, phase: JobPhase) {
        self.spinner.set_message(format!("{job}: {phase}"));
    }

    fn page_fetched(&self, url: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Fetching [{current}/{total}] {url}"));
    }

    fn page_parsed(&self, url: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Extracting [{current}/{total}] {url}"));
    }

    fn done(&self, _summary: &JobSummary) {
        self.spinner.finish_and_clear();
    }
}
