mod board;
mod pool;

pub use board::{ProgressBoard, ProgressReporter, WorkerSlot};
pub use pool::BatchRunner;

use std::time::Duration;

use crate::error::JobFailure;
use crate::ledger::{Journal, OutputLedger};

/// What a job function can reach while it runs.
pub struct JobContext<'a, R> {
    pub journal: &'a Journal,
    pub progress: &'a ProgressReporter,
    pub ledger: &'a OutputLedger<R>,
}

/// A verified completion. `summary` goes to the general journal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobSuccess {
    pub summary: String,
}

impl JobSuccess {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
        }
    }
}

pub type JobResult = Result<JobSuccess, JobFailure>;

/// One render tick: run-wide tallies plus each worker's last status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardFrame {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub workers: Vec<(WorkerSlot, String)>,
}

impl BoardFrame {
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }

    /// `PROGRESS [completed/total | failed]`
    pub fn header(&self) -> String {
        format!(
            "PROGRESS [{}/{} | {}]",
            self.completed, self.total, self.failed
        )
    }
}

/// Final tally of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.completed == self.total
    }
}

/// Consumer of render ticks. The terminal implementation lives in [`crate::ui`].
pub trait BoardRenderer {
    fn draw(&mut self, frame: &BoardFrame);

    fn finish(&mut self, _summary: &RunSummary) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_matches_progress_format() {
        let frame = BoardFrame {
            completed: 12,
            failed: 2,
            total: 40,
            workers: vec![],
        };
        assert_eq!(frame.header(), "PROGRESS [12/40 | 2]");
        assert_eq!(frame.finished(), 14);
    }

    #[test]
    fn summary_clean_only_without_failures() {
        let mut summary = RunSummary {
            total: 3,
            completed: 3,
            failed: 0,
            elapsed: Duration::from_secs(1),
        };
        assert!(summary.is_clean());
        summary.completed = 2;
        summary.failed = 1;
        assert!(!summary.is_clean());
    }
}
