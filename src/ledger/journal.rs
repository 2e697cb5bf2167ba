//! Append-only JSONL journal for the in-memory ledger.
//!
//! One line per committed changeset, holding the records as they read after
//! the commit. Replaying the lines in order rebuilds the ledger exactly.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::events::EventEnvelope;
use crate::ledger::IdempotencyRecord;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::{Entity, Timestamp};

#[derive(Debug)]
pub struct Journal {
    file: File,
    path: String,
    /// Bytes covered by complete entries.
    len: u64,
    fsync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub commit_seq: u64,
    pub recorded_at: Timestamp,
    /// Records after the commit, versions already bumped.
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub idempotency: Option<IdempotencyRecord>,
    #[serde(default)]
    pub events: Vec<EventEnvelope>,
}

#[derive(Debug, Clone, Default)]
pub struct Recovery {
    pub entries: Vec<JournalEntry>,
    /// Byte offset just past the last complete entry.
    pub valid_len: u64,
    /// Bytes of torn tail after `valid_len`, left by a crash mid-append.
    pub torn_bytes: u64,
}

impl Journal {
    /// Recovers `path`, cuts any torn tail and opens it for appends.
    pub fn open(path: &str) -> io::Result<(Self, Recovery)> {
        let recovery = Self::recover(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if recovery.torn_bytes > 0 {
            file.set_len(recovery.valid_len)?;
            file.sync_data()?;
            log(
                Level::Warn,
                Domain::Ledger,
                "journal_truncate",
                obj(&[
                    ("path", v_str(path)),
                    ("valid_len", json!(recovery.valid_len)),
                    ("torn_bytes", json!(recovery.torn_bytes)),
                ]),
            );
        }
        let journal = Self { file, path: path.to_string(), len: recovery.valid_len, fsync: false };
        Ok((journal, recovery))
    }

    /// Sync to disk after every append.
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    /// Appends one newline-terminated entry. On failure the file is cut back
    /// to its previous length so no partial line survives.
    pub fn append_entry(&mut self, entry: &JournalEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        match self.write_line(&line) {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(err) => {
                let rollback = self.file.set_len(self.len);
                log(
                    Level::Error,
                    Domain::Ledger,
                    "journal_append_failed",
                    obj(&[
                        ("path", v_str(&self.path)),
                        ("msg", v_str(&err.to_string())),
                        ("rolled_back", json!(rollback.is_ok())),
                    ]),
                );
                Err(err)
            }
        }
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line)?;
        self.file.flush()?;
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Parses every complete entry in commit order.
    ///
    /// Only the final segment may be damaged: a missing newline or an
    /// unparsable last line is a torn tail and is excluded from `valid_len`.
    /// An unparsable line with complete entries after it is corruption and
    /// fails with `InvalidData`.
    pub fn recover(path: &str) -> io::Result<Recovery> {
        if !Path::new(path).exists() {
            return Ok(Recovery::default());
        }
        let mut bytes = Vec::new();
        OpenOptions::new().read(true).open(path)?.read_to_end(&mut bytes)?;

        let mut recovery = Recovery::default();
        let mut offset = 0usize;
        let mut lineno = 0usize;
        while offset < bytes.len() {
            lineno += 1;
            let Some(nl) = bytes[offset..].iter().position(|b| *b == b'\n') else {
                break;
            };
            let end = offset + nl + 1;
            let line = &bytes[offset..offset + nl];
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                offset = end;
                recovery.valid_len = end as u64;
                continue;
            }
            match serde_json::from_slice::<JournalEntry>(line) {
                Ok(entry) => {
                    recovery.entries.push(entry);
                    offset = end;
                    recovery.valid_len = end as u64;
                }
                Err(err) if end == bytes.len() => {
                    log(
                        Level::Warn,
                        Domain::Ledger,
                        "journal_torn_tail",
                        obj(&[("path", v_str(path)), ("line", json!(lineno)), ("msg", v_str(&err.to_string()))]),
                    );
                    break;
                }
                Err(err) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{}: corrupt entry at line {}: {}", path, lineno, err),
                    ));
                }
            }
        }
        recovery.torn_bytes = bytes.len() as u64 - recovery.valid_len;
        Ok(recovery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tournament;

    fn entry(seq: u64) -> JournalEntry {
        let mut t = Tournament::new("t-1", "League", 1000);
        t.version = seq;
        JournalEntry {
            commit_seq: seq,
            recorded_at: seq * 10,
            entities: vec![Entity::Tournament(t)],
            idempotency: None,
            events: vec![],
        }
    }

    #[test]
    fn test_journal_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.journal");
        let path = path.to_str().unwrap();
        {
            let (mut j, rec) = Journal::open(path).unwrap();
            assert!(rec.entries.is_empty());
            j.append_entry(&entry(1)).unwrap();
            j.append_entry(&entry(2)).unwrap();
        }
        let rec = Journal::recover(path).unwrap();
        assert_eq!(rec.entries.len(), 2);
        assert_eq!(rec.entries[1].commit_seq, 2);
        assert_eq!(rec.torn_bytes, 0);
        assert_eq!(rec.valid_len, std::fs::metadata(path).unwrap().len());
    }

    #[test]
    fn test_torn_tail_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.journal");
        let path = path.to_str().unwrap();
        {
            let (mut j, _) = Journal::open(path).unwrap();
            j.append_entry(&entry(1)).unwrap();
        }
        let good_len = std::fs::metadata(path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(path).unwrap();
            f.write_all(b"{\"commit_seq\":2,\"recorded_").unwrap();
        }
        let rec = Journal::recover(path).unwrap();
        assert_eq!(rec.entries.len(), 1);
        assert_eq!(rec.valid_len, good_len);
        assert!(rec.torn_bytes > 0);
    }

    #[test]
    fn test_reopen_cuts_torn_tail_before_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.journal");
        let path = path.to_str().unwrap();
        {
            let (mut j, _) = Journal::open(path).unwrap();
            j.append_entry(&entry(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(path).unwrap();
            f.write_all(b"{\"commit_seq\":2,\"recor").unwrap();
        }
        {
            let (mut j, rec) = Journal::open(path).unwrap();
            assert_eq!(rec.entries.len(), 1);
            j.append_entry(&entry(2)).unwrap();
        }
        let rec = Journal::recover(path).unwrap();
        let seqs: Vec<_> = rec.entries.iter().map(|e| e.commit_seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(rec.torn_bytes, 0);
    }

    #[test]
    fn test_corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.journal");
        let path = path.to_str().unwrap();
        let mut bytes = serde_json::to_vec(&entry(1)).unwrap();
        bytes.extend_from_slice(b"\nnot json\n");
        bytes.extend_from_slice(&serde_json::to_vec(&entry(2)).unwrap());
        bytes.push(b'\n');
        std::fs::write(path, bytes).unwrap();

        let err = Journal::recover(path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(Journal::open(path).is_err());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let rec = Journal::recover("/nonexistent/dir/ledger.journal").unwrap();
        assert!(rec.entries.is_empty());
    }
}
