//! Read-only overview of every stage's on-disk state.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::hls::{HlsJob, HlsRecord};
use super::loudness::{ApplyJob, MeasureJob, MeasuredTrack, NormalizedTrack};
use super::{APPLY_STAGE, HLS_STAGE, MEASURE_STAGE, StageFiles};
use crate::ledger::{FailedEntry, Journal, LedgerRecord, OutputLedger};
use crate::worklist::Worklist;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub stage: &'static str,
    /// `None` until the stage has a worklist.
    pub worklist: Option<usize>,
    pub recorded: usize,
    pub pending: usize,
    /// Latest failure per id that the ledger does not yet certify.
    pub failed: Vec<FailedEntry>,
}

impl StageStatus {
    fn collect<P, R>(state_dir: &Path, stage: &'static str) -> Result<Self>
    where
        P: Serialize + DeserializeOwned,
        R: LedgerRecord,
    {
        let files = StageFiles::new(state_dir, stage);
        let recorded = OutputLedger::<R>::load_all(&files.ledger)?;
        let worklist = if files.worklist.is_file() {
            Some(Worklist::<P>::load(&files.worklist)?)
        } else {
            None
        };
        let pending = worklist
            .as_ref()
            .map_or(0, |list| list.ids().filter(|id| !recorded.contains(*id)).count());

        Ok(Self {
            stage,
            worklist: worklist.as_ref().map(Worklist::len),
            recorded: recorded.len(),
            pending,
            failed: outstanding_failures(Journal::read_failed(&files.journal.failed)?, &recorded),
        })
    }
}

/// Failures still worth looking at: the newest entry per id, minus ids that
/// later completed.
fn outstanding_failures(entries: Vec<FailedEntry>, recorded: &HashSet<String>) -> Vec<FailedEntry> {
    let mut seen = HashSet::new();
    let mut latest: Vec<FailedEntry> = entries
        .into_iter()
        .rev()
        .filter(|e| !recorded.contains(&e.id) && seen.insert(e.id.clone()))
        .collect();
    latest.reverse();
    latest
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.worklist {
            Some(total) => writeln!(
                f,
                "{}: {} items, {} recorded, {} pending, {} failing",
                self.stage,
                total,
                self.recorded,
                self.pending,
                self.failed.len()
            )?,
            None => writeln!(f, "{}: no worklist ({} recorded)", self.stage, self.recorded)?,
        }
        for entry in &self.failed {
            writeln!(f, "    {}\t{}", entry.id, entry.reason)?;
        }
        Ok(())
    }
}

/// Status of every stage, in pipeline order.
pub fn collect(state_dir: &Path) -> Result<Vec<StageStatus>> {
    Ok(vec![
        StageStatus::collect::<MeasureJob, MeasuredTrack>(state_dir, MEASURE_STAGE)?,
        StageStatus::collect::<ApplyJob, NormalizedTrack>(state_dir, APPLY_STAGE)?,
        StageStatus::collect::<HlsJob, HlsRecord>(state_dir, HLS_STAGE)?,
    ])
}
