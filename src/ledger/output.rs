use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::open_append;

/// A record certified as complete. Each record names the work item id it retires.
pub trait LedgerRecord: Serialize + DeserializeOwned {
    fn record_id(&self) -> &str;

    /// Builds a record from a bare-id line, for ledgers written as plain text.
    /// Record types that need more than an id return `None` and such lines are skipped.
    fn from_plain_id(_id: &str) -> Option<Self> {
        None
    }
}

/// Append-only JSON-lines log of verified completions.
///
/// This is the only structure trusted when filtering a worklist on resume.
/// Duplicate ids are tolerated on write and collapse on read.
pub struct OutputLedger<R> {
    path: PathBuf,
    file: Mutex<File>,
    _record: PhantomData<fn(&R)>,
}

impl<R: LedgerRecord> OutputLedger<R> {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(open_append(path)?),
            _record: PhantomData,
        })
    }

    /// Appends one record and flushes it before returning.
    pub fn write(&self, record: &R) -> io::Result<()> {
        let mut line = serde_json::to_string(record).map_err(io::Error::other)?;
        line.push('\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .inspect_err(|e| {
                tracing::error!(path = %self.path.display(), error = %e, "ledger append failed")
            })
    }

    /// Every id recorded so far. A missing ledger means nothing is complete yet.
    pub fn load_all(path: &Path) -> io::Result<HashSet<String>> {
        let mut ids = HashSet::new();
        read_lines(path, |line| match parse_line::<R>(line) {
            Parsed::Record(record) => {
                ids.insert(record.record_id().to_string());
            }
            Parsed::PlainId(id) => {
                ids.insert(id.to_string());
            }
            Parsed::Corrupt(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable ledger line");
            }
        })?;
        Ok(ids)
    }

    /// Typed records in file order; the first record wins for a repeated id.
    pub fn load_records(path: &Path) -> io::Result<Vec<R>> {
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        read_lines(path, |line| {
            let record = match parse_line::<R>(line) {
                Parsed::Record(record) => Some(record),
                Parsed::PlainId(id) => R::from_plain_id(id),
                Parsed::Corrupt(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable ledger line");
                    None
                }
            };
            if let Some(record) = record
                && seen.insert(record.record_id().to_string())
            {
                records.push(record);
            }
        })?;
        Ok(records)
    }
}

enum Parsed<'a, R> {
    Record(R),
    PlainId(&'a str),
    Corrupt(serde_json::Error),
}

fn parse_line<R: DeserializeOwned>(line: &str) -> Parsed<'_, R> {
    if line.starts_with('{') {
        match serde_json::from_str(line) {
            Ok(record) => Parsed::Record(record),
            Err(e) => Parsed::Corrupt(e),
        }
    } else {
        Parsed::PlainId(line)
    }
}

fn read_lines(path: &Path, mut f: impl FnMut(&str)) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            f(line);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Done {
        path: String,
    }

    impl LedgerRecord for Done {
        fn record_id(&self) -> &str {
            &self.path
        }

        fn from_plain_id(id: &str) -> Option<Self> {
            Some(Done { path: id.to_string() })
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Measured {
        path: String,
        gain: f64,
    }

    impl LedgerRecord for Measured {
        fn record_id(&self) -> &str {
            &self.path
        }
    }

    fn done(p: &str) -> Done {
        Done { path: p.to_string() }
    }

    #[test]
    fn missing_ledger_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let ids = OutputLedger::<Done>::load_all(&tmp.path().join("ledger.jsonl")).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn written_records_are_durable_without_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.jsonl");
        let ledger = OutputLedger::<Done>::open(&path).unwrap();
        ledger.write(&done("/music/a.flac")).unwrap();

        let ids = OutputLedger::<Done>::load_all(&path).unwrap();
        assert!(ids.contains("/music/a.flac"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"path\":\"/music/a.flac\"}\n");
    }

    #[test]
    fn duplicates_collapse_on_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.jsonl");
        let ledger = OutputLedger::<Done>::open(&path).unwrap();
        ledger.write(&done("a")).unwrap();
        ledger.write(&done("b")).unwrap();
        ledger.write(&done("a")).unwrap();

        assert_eq!(OutputLedger::<Done>::load_all(&path).unwrap().len(), 2);
        assert_eq!(
            OutputLedger::<Done>::load_records(&path).unwrap(),
            vec![done("a"), done("b")]
        );
    }

    #[test]
    fn plain_id_lines_are_accepted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("completed.txt");
        fs::write(&path, "3f2a\n\n  9c1d  \n").unwrap();

        let ids = OutputLedger::<Done>::load_all(&path).unwrap();
        assert_eq!(ids, HashSet::from(["3f2a".to_string(), "9c1d".to_string()]));
        assert_eq!(OutputLedger::<Done>::load_records(&path).unwrap().len(), 2);
        // Records that carry data cannot be rebuilt from a bare id.
        assert!(OutputLedger::<Measured>::load_records(&path).unwrap().is_empty());
    }

    #[test]
    fn torn_line_is_skipped_and_next_write_is_clean() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.jsonl");
        fs::write(&path, "{\"path\":\"a\",\"gain\":1.0}\n{\"path\":\"b\",\"ga").unwrap();

        let ledger = OutputLedger::<Measured>::open(&path).unwrap();
        ledger
            .write(&Measured {
                path: "c".into(),
                gain: 2.0,
            })
            .unwrap();

        let ids = OutputLedger::<Measured>::load_all(&path).unwrap();
        assert_eq!(ids, HashSet::from(["a".to_string(), "c".to_string()]));
    }
}
