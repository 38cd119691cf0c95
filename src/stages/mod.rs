//! Pipeline stages: generate a worklist, subtract what the ledger already
//! certifies, and run the rest through a [`BatchRunner`].
//!
//! Every stage keeps its files in `<state_dir>/<stage>/`. Stages hand work to
//! each other only through those files.

pub mod hls;
pub mod loudness;
pub mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use walkdir::WalkDir;

use crate::ledger::{Journal, JournalPaths, LedgerRecord, OutputLedger};
use crate::runner::{BatchRunner, BoardRenderer, JobContext, JobResult, RunSummary};
use crate::worklist::{WorkItem, Worklist};

pub const MEASURE_STAGE: &str = "normalize-measure";
pub const APPLY_STAGE: &str = "normalize-apply";
pub const HLS_STAGE: &str = "hls";

/// On-disk layout of one stage.
#[derive(Debug, Clone)]
pub struct StageFiles {
    pub dir: PathBuf,
    pub worklist: PathBuf,
    pub ledger: PathBuf,
    pub journal: JournalPaths,
}

impl StageFiles {
    pub fn new(state_dir: &Path, stage: &str) -> Self {
        let dir = state_dir.join(stage);
        Self {
            worklist: dir.join("worklist.json"),
            ledger: dir.join("ledger.jsonl"),
            journal: JournalPaths {
                general: dir.join("journal.log"),
                failed: dir.join("failed.log"),
                completed: dir.join("completed.log"),
            },
            dir,
        }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create stage directory {}", self.dir.display()))
    }
}

/// Runtime knobs shared by every stage run.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub concurrency: usize,
    pub render_interval: Duration,
}

/// Filters `worklist` against the ledger, then drives the remainder to completion.
pub fn run_stage<P, R, F>(
    files: &StageFiles,
    worklist: Worklist<P>,
    options: RunOptions,
    renderer: &mut impl BoardRenderer,
    job: F,
) -> Result<RunSummary>
where
    P: Serialize + DeserializeOwned + Send + 'static,
    R: LedgerRecord + 'static,
    F: Fn(&JobContext<'_, R>, &WorkItem<P>) -> JobResult + Send + Sync + 'static,
{
    files.ensure_dir()?;

    let completed = OutputLedger::<R>::load_all(&files.ledger)
        .with_context(|| format!("failed to read ledger {}", files.ledger.display()))?;
    let loaded = worklist.len();
    let pending = worklist.without_completed(&completed);
    tracing::info!(
        loaded,
        skipped = loaded - pending.len(),
        remaining = pending.len(),
        workers = options.concurrency,
        "filtered completed work"
    );

    let journal = Arc::new(
        Journal::open(&files.journal)
            .with_context(|| format!("failed to open journal in {}", files.dir.display()))?,
    );
    let ledger = Arc::new(
        OutputLedger::<R>::open(&files.ledger)
            .with_context(|| format!("failed to open ledger {}", files.ledger.display()))?,
    );
    journal.report_general(&format!(
        "run started: {} pending, {} already complete, {} workers",
        pending.len(),
        loaded - pending.len(),
        options.concurrency
    ))?;

    let mut runner = BatchRunner::new(options.concurrency, Arc::clone(&journal), ledger, job)?
        .with_render_interval(options.render_interval);
    for item in pending.into_items() {
        runner.submit(item);
    }

    let summary = runner.wait_and_render(renderer);
    journal.report_general(&format!(
        "run finished: {} completed, {} failed of {}",
        summary.completed, summary.failed, summary.total
    ))?;
    Ok(summary)
}

/// Every regular file under `root` whose extension is in `extensions`
/// (compared case-insensitively), in walk order.
pub fn scan_files(root: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(crate::error::BatchError::MissingRoot(root.to_path_buf()).into());
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                let matches = entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)));
                if matches {
                    found.push(entry.into_path());
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "skipping unreadable entry"),
        }
    }
    tracing::info!(root = %root.display(), files = found.len(), "scan finished");
    Ok(found)
}

/// Like [`scan_files`], minus paths that are not valid UTF-8. Those cannot
/// serve as stable ids, so each one is logged and noted in the stage journal
/// instead of failing the whole scan.
pub fn scan_sources(
    root: &Path,
    extensions: &[String],
    files: &StageFiles,
) -> Result<Vec<PathBuf>> {
    let (sources, unreadable): (Vec<_>, Vec<_>) = scan_files(root, extensions)?
        .into_iter()
        .partition(|p| p.to_str().is_some());
    if unreadable.is_empty() {
        return Ok(sources);
    }

    files.ensure_dir()?;
    let journal = Journal::open(&files.journal)
        .with_context(|| format!("failed to open journal in {}", files.dir.display()))?;
    for path in &unreadable {
        tracing::warn!(path = %path.display(), "skipping non-UTF-8 path");
        journal.report_general(&format!("skipped non-UTF-8 path: {}", path.display()))?;
    }
    Ok(sources)
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use crate::runner::{BoardFrame, BoardRenderer};

    pub struct Quiet;

    impl BoardRenderer for Quiet {
        fn draw(&mut self, _frame: &BoardFrame) {}
    }

    /// Writes an executable `sh` script standing in for ffmpeg or ffprobe.
    pub fn fake_tool(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }
}
