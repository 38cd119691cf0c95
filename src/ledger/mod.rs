//! Durable append-only logs: the per-run [`Journal`] and the resume-authoritative
//! [`OutputLedger`].
//!
//! Both share the same write discipline: one lock per stream, one line per
//! call, flushed before the call returns.

mod journal;
mod output;

pub use journal::{FailedEntry, Journal, JournalPaths};
pub use output::{LedgerRecord, OutputLedger};

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Opens `path` for appending, creating it empty if absent.
///
/// A file whose last byte is not a newline was cut off mid-write by an
/// earlier crash; a newline is appended so the next entry starts clean.
pub(crate) fn open_append(path: &Path) -> io::Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;

    let len = file.metadata()?.len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            tracing::warn!(path = %path.display(), "repairing torn trailing line");
            file.write_all(b"\n")?;
            file.flush()?;
        }
    }

    Ok(file)
}

/// Collapses a message onto one line so each entry stays one record.
pub(crate) fn single_line(text: &str) -> String {
    text.chars()
        .map(|c| if matches!(c, '\n' | '\r' | '\t') { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn open_append_creates_missing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("new.log");
        open_append(&path).unwrap();
        assert!(path.exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn open_append_repairs_torn_tail() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("torn.log");
        fs::write(&path, "a\n{\"path\":\"/mus").unwrap();

        let mut file = open_append(&path).unwrap();
        file.write_all(b"b\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "a\n{\"path\":\"/mus\nb\n");
    }

    #[test]
    fn open_append_leaves_clean_file_alone() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("clean.log");
        fs::write(&path, "a\n").unwrap();
        open_append(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\n");
    }

    #[test]
    fn single_line_strips_control_breaks() {
        assert_eq!(single_line("bad\nthing\thappened\r"), "bad thing happened ");
    }
}
