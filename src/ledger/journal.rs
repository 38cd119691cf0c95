use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};

use super::{open_append, single_line};

/// Locations of the three journal streams of one stage.
#[derive(Debug, Clone)]
pub struct JournalPaths {
    pub general: PathBuf,
    pub failed: PathBuf,
    pub completed: PathBuf,
}

/// Counts of terminal outcomes recorded during the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalStats {
    pub completed: usize,
    pub failed: usize,
}

/// One parsed line of the `failed` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEntry {
    pub id: String,
    pub reason: String,
}

/// Append-only outcome log split into general, failed and completed streams.
///
/// Each stream has its own lock, so a `failed` write never waits on a
/// `completed` write. Entries are flushed before the call returns.
pub struct Journal {
    general: Mutex<File>,
    failed: Mutex<File>,
    completed: Mutex<File>,
    completed_count: AtomicUsize,
    failed_count: AtomicUsize,
}

impl Journal {
    /// Opens (creating empty if absent) all three streams.
    pub fn open(paths: &JournalPaths) -> io::Result<Self> {
        Ok(Self {
            general: Mutex::new(open_append(&paths.general)?),
            failed: Mutex::new(open_append(&paths.failed)?),
            completed: Mutex::new(open_append(&paths.completed)?),
            completed_count: AtomicUsize::new(0),
            failed_count: AtomicUsize::new(0),
        })
    }

    /// Free-form progress trace, prefixed with an RFC 3339 timestamp.
    pub fn report_general(&self, msg: &str) -> io::Result<()> {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        append_line(&self.general, &format!("{stamp} {}", single_line(msg)))
    }

    pub fn report_failed(&self, id: &str, reason: &str) -> io::Result<()> {
        self.failed_count.fetch_add(1, Ordering::SeqCst);
        append_line(
            &self.failed,
            &format!("{}\t{}", single_line(id), single_line(reason)),
        )
    }

    pub fn report_completed(&self, id: &str) -> io::Result<()> {
        self.completed_count.fetch_add(1, Ordering::SeqCst);
        append_line(&self.completed, &single_line(id))
    }

    pub fn stats(&self) -> JournalStats {
        JournalStats {
            completed: self.completed_count.load(Ordering::SeqCst),
            failed: self.failed_count.load(Ordering::SeqCst),
        }
    }

    /// Reads every entry of a `failed` stream. A missing file has no entries.
    pub fn read_failed(path: &Path) -> io::Result<Vec<FailedEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let (id, reason) = line.split_once('\t').unwrap_or((line.as_str(), ""));
            entries.push(FailedEntry {
                id: id.to_string(),
                reason: reason.to_string(),
            });
        }
        Ok(entries)
    }
}

fn append_line(stream: &Mutex<File>, line: &str) -> io::Result<()> {
    let mut file = stream.lock().unwrap_or_else(PoisonError::into_inner);
    // Single write_all per entry.
    file.write_all(format!("{line}\n").as_bytes())?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn paths(dir: &Path) -> JournalPaths {
        JournalPaths {
            general: dir.join("journal.log"),
            failed: dir.join("failed.log"),
            completed: dir.join("completed.log"),
        }
    }

    #[test]
    fn open_creates_all_streams() {
        let tmp = TempDir::new().unwrap();
        let p = paths(tmp.path());
        Journal::open(&p).unwrap();
        assert!(p.general.exists());
        assert!(p.failed.exists());
        assert!(p.completed.exists());
    }

    #[test]
    fn entries_are_visible_immediately() {
        let tmp = TempDir::new().unwrap();
        let p = paths(tmp.path());
        let journal = Journal::open(&p).unwrap();

        journal.report_completed("a").unwrap();
        journal.report_failed("b", "process returned exit status: 1").unwrap();
        journal.report_general("queued 2 items").unwrap();

        // No drop, no explicit flush: the bytes must already be on disk.
        assert_eq!(fs::read_to_string(&p.completed).unwrap(), "a\n");
        assert_eq!(
            fs::read_to_string(&p.failed).unwrap(),
            "b\tprocess returned exit status: 1\n"
        );
        let general = fs::read_to_string(&p.general).unwrap();
        assert!(general.trim_end().ends_with("queued 2 items"));
        assert_eq!(journal.stats(), JournalStats { completed: 1, failed: 1 });
    }

    #[test]
    fn logs_accumulate_across_runs_but_counts_do_not() {
        let tmp = TempDir::new().unwrap();
        let p = paths(tmp.path());
        {
            let journal = Journal::open(&p).unwrap();
            journal.report_completed("a").unwrap();
        }
        let journal = Journal::open(&p).unwrap();
        journal.report_completed("a").unwrap();

        assert_eq!(fs::read_to_string(&p.completed).unwrap(), "a\na\n");
        assert_eq!(journal.stats().completed, 1);
    }

    #[test]
    fn multiline_reason_stays_one_entry() {
        let tmp = TempDir::new().unwrap();
        let p = paths(tmp.path());
        let journal = Journal::open(&p).unwrap();
        journal.report_failed("x", "line one\nline two").unwrap();

        let entries = Journal::read_failed(&p.failed).unwrap();
        assert_eq!(
            entries,
            vec![FailedEntry {
                id: "x".into(),
                reason: "line one line two".into()
            }]
        );
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        let tmp = TempDir::new().unwrap();
        let p = paths(tmp.path());
        let journal = Arc::new(Journal::open(&p).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let journal = Arc::clone(&journal);
                thread::spawn(move || {
                    for i in 0..50 {
                        if i % 2 == 0 {
                            journal.report_completed(&format!("{t}-{i}")).unwrap();
                        } else {
                            journal.report_failed(&format!("{t}-{i}"), "boom").unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let completed = fs::read_to_string(&p.completed).unwrap();
        assert_eq!(completed.lines().count(), 200);
        assert_eq!(Journal::read_failed(&p.failed).unwrap().len(), 200);
        assert_eq!(journal.stats(), JournalStats { completed: 200, failed: 200 });
    }

    #[test]
    fn read_failed_on_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let entries = Journal::read_failed(&tmp.path().join("nope.log")).unwrap();
        assert!(entries.is_empty());
    }
}
