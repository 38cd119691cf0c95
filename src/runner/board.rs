use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Index of a worker thread in the pool, stable for the lifetime of a run.
pub type WorkerSlot = usize;

/// Latest human-readable status per worker. Presentation only: last write
/// wins and nothing ever waits on it.
#[derive(Debug, Default)]
pub struct ProgressBoard {
    states: Mutex<BTreeMap<WorkerSlot, String>>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, worker: WorkerSlot, text: impl Into<String>) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.insert(worker, text.into());
    }

    pub fn snapshot(&self) -> BTreeMap<WorkerSlot, String> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handle given to a job, bound to the slot of the worker running it.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    board: Arc<ProgressBoard>,
    slot: WorkerSlot,
}

impl ProgressReporter {
    pub fn new(board: Arc<ProgressBoard>, slot: WorkerSlot) -> Self {
        Self { board, slot }
    }

    pub fn report_state(&self, text: impl Into<String>) {
        self.board.set_state(self.slot, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins_per_worker() {
        let board = Arc::new(ProgressBoard::new());
        let r0 = ProgressReporter::new(Arc::clone(&board), 0);
        let r1 = ProgressReporter::new(Arc::clone(&board), 1);

        r0.report_state("Processing a.flac");
        r1.report_state("Processing b.flac");
        r0.report_state("[00:00:10.00 ( 9.1x)] a.flac");

        let snap = board.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[&0], "[00:00:10.00 ( 9.1x)] a.flac");
        assert_eq!(snap[&1], "Processing b.flac");
    }

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let board = ProgressBoard::new();
        board.set_state(3, "before");
        let snap = board.snapshot();
        board.set_state(3, "after");
        assert_eq!(snap[&3], "before");
    }
}
