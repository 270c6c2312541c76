//! Progress callbacks for long-running jobs.

use adaptcrawl_shared::{JobPhase, JobSummary};

/// Progress callback for reporting job status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a job enters a new phase.
    fn phase(&self, job: &str, phase: JobPhase);
    /// Called after each page fetched successfully during Crawl. Failed
    /// fetches are not reported, so `current` counts pages held.
    fn page_fetched(&self, url: &str, current: usize, total: usize);
    /// Called after each page has been through the strategy ladder.
    fn page_parsed(&self, url: &str, current: usize, total: usize);
    /// Called once the job reaches a terminal phase.
    fn done(&self, summary: &JobSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _job: &str, _phase: JobPhase) {}
    fn page_fetched(&self, _url: &str, _current: usize, _total: usize) {}
    fn page_parsed(&self, _url: &str, _current: usize, _total: usize) {}
    fn done(&self, _summary: &JobSummary) {}
}
