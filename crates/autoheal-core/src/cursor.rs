//! Read offsets for append-only, delimiter-separated log files.
//!
//! A log file holds records separated by a delimiter line:
//!
//! ```text
//! Error in /warehouse/query-history:
//! QUERY_ID: 01b2...
//! ERROR_CODE: 002003
//! ------------------------------------------------------------
//! ```
//!
//! [`CursorTracker::read_new`] returns only complete records. Bytes after the
//! last delimiter line stay unread until a later call sees the delimiter that
//! closes them, so a writer caught mid-record never produces a torn record.

use crate::error::Result;
use crate::io::atomic_write;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Persisted read position for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub source_id: String,
    pub offset: u64,
}

/// One complete record and the file offset just past it, delimiter included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub text: String,
    pub end_offset: u64,
}

/// Result of one [`CursorTracker::read_new`] or [`CursorTracker::peek_new`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    /// Complete records in file order, trimmed, empty records dropped.
    pub records: Vec<LogRecord>,
    /// The file was shorter than the stored offset and was re-read from 0.
    pub rotated: bool,
    /// Bytes past the last delimiter that are held back for the next read.
    pub pending_bytes: u64,
}

impl ReadBatch {
    pub fn texts(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.text.as_str()).collect()
    }
}

pub struct CursorTracker {
    log_path: PathBuf,
    state_path: PathBuf,
    delimiter: String,
    cursor: Cursor,
}

impl CursorTracker {
    /// Open a tracker for `log_path`, resuming from the offset stored at
    /// `state_path` if one exists.
    pub fn open(
        source_id: &str,
        log_path: PathBuf,
        state_path: PathBuf,
        delimiter: impl Into<String>,
    ) -> Result<Self> {
        let cursor = if state_path.exists() {
            let data = std::fs::read_to_string(&state_path)?;
            match serde_json::from_str::<Cursor>(&data) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(
                        source = source_id,
                        path = %state_path.display(),
                        error = %e,
                        "unreadable cursor state, starting from offset 0"
                    );
                    Cursor {
                        source_id: source_id.to_string(),
                        offset: 0,
                    }
                }
            }
        } else {
            Cursor {
                source_id: source_id.to_string(),
                offset: 0,
            }
        };
        Ok(Self {
            log_path,
            state_path,
            delimiter: delimiter.into(),
            cursor,
        })
    }

    pub fn offset(&self) -> u64 {
        self.cursor.offset
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Read every complete record appended since the last call and advance
    /// the stored offset past them.
    pub fn read_new(&mut self) -> Result<ReadBatch> {
        let batch = self.peek_new()?;
        if let Some(last) = batch.records.last() {
            self.advance_to(last.end_offset)?;
        }
        Ok(batch)
    }

    /// Read complete records past the stored offset without consuming them.
    /// The caller advances with [`CursorTracker::advance_to`] as each record
    /// is handled, so records not yet handled are read again after a restart.
    ///
    /// The last record's `end_offset` also covers any empty records after
    /// it. A rotation reset, and a batch holding only empty records, are
    /// persisted here.
    pub fn peek_new(&mut self) -> Result<ReadBatch> {
        let mut batch = ReadBatch::default();

        let mut file = match std::fs::File::open(&self.log_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(batch),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len < self.cursor.offset {
            tracing::info!(
                source = %self.cursor.source_id,
                path = %self.log_path.display(),
                stored_offset = self.cursor.offset,
                file_len = len,
                "log file shrank, resetting cursor"
            );
            self.advance_to(0)?;
            batch.rotated = true;
        }

        let start = self.cursor.offset;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::with_capacity((len - start) as usize);
        file.read_to_end(&mut buf)?;

        let (records, consumed) = split_complete_records(&buf, &self.delimiter);
        batch.pending_bytes = (buf.len() - consumed) as u64;
        batch.records = records
            .into_iter()
            .map(|(text, end)| LogRecord {
                text,
                end_offset: start + end as u64,
            })
            .collect();

        let batch_end = start + consumed as u64;
        match batch.records.last_mut() {
            Some(last) => last.end_offset = batch_end,
            None if consumed > 0 => self.advance_to(batch_end)?,
            None => {}
        }
        Ok(batch)
    }

    /// Record that everything before `offset` has been handled.
    pub fn advance_to(&mut self, offset: u64) -> Result<()> {
        self.cursor.offset = offset;
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.cursor)?;
        atomic_write(&self.state_path, &data)
    }
}

/// Split `buf` at delimiter lines. Returns each complete record with the
/// offset just past its delimiter line, and the number of bytes spanned up to
/// and including the final delimiter's newline.
fn split_complete_records(buf: &[u8], delimiter: &str) -> (Vec<(String, usize)>, usize) {
    let mut records = Vec::new();
    let mut record_start = 0usize;
    let mut consumed = 0usize;
    let mut line_start = 0usize;

    while let Some(nl) = buf[line_start..].iter().position(|&b| b == b'\n') {
        let line_end = line_start + nl;
        let line = String::from_utf8_lossy(&buf[line_start..line_end]);
        if line.trim_end_matches('\r').trim() == delimiter {
            let text = String::from_utf8_lossy(&buf[record_start..line_start]);
            let text = text.trim();
            if !text.is_empty() {
                records.push((text.to_string(), line_end + 1));
            }
            record_start = line_end + 1;
            consumed = record_start;
        }
        line_start = line_end + 1;
    }

    (records, consumed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_delimiter;
    use std::io::Write;
    use tempfile::TempDir;

    fn record(body: &str) -> String {
        format!("{body}\n{}\n", default_delimiter())
    }

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn tracker(dir: &TempDir) -> CursorTracker {
        CursorTracker::open(
            "cluster",
            dir.path().join("errors.log"),
            dir.path().join("state/cluster.json"),
            default_delimiter(),
        )
        .unwrap()
    }

    #[test]
    fn missing_file_reads_nothing() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        assert_eq!(t.read_new().unwrap(), ReadBatch::default());
        assert_eq!(t.offset(), 0);
    }

    #[test]
    fn reads_only_new_records() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("errors.log");
        append(&log, &record("Error in a:\nfirst"));
        let mut t = tracker(&dir);

        let batch = t.read_new().unwrap();
        assert_eq!(batch.texts(), vec!["Error in a:\nfirst"]);
        let after_first = t.offset();

        assert!(t.read_new().unwrap().records.is_empty());
        assert_eq!(t.offset(), after_first);

        append(&log, &record("second"));
        append(&log, &record("third"));
        let batch = t.read_new().unwrap();
        assert_eq!(batch.texts(), vec!["second", "third"]);
        assert!(t.offset() > after_first);
    }

    #[test]
    fn partial_tail_is_held_back() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("errors.log");
        append(&log, &record("complete"));
        append(&log, "half written");
        let mut t = tracker(&dir);

        let batch = t.read_new().unwrap();
        assert_eq!(batch.texts(), vec!["complete"]);
        assert_eq!(batch.pending_bytes, "half written".len() as u64);

        append(&log, &format!(" record\n{}\n", default_delimiter()));
        let batch = t.read_new().unwrap();
        assert_eq!(batch.texts(), vec!["half written record"]);
        assert_eq!(batch.pending_bytes, 0);
    }

    #[test]
    fn delimiter_without_newline_is_not_consumed() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("errors.log");
        append(&log, &format!("body\n{}", default_delimiter()));
        let mut t = tracker(&dir);
        assert!(t.read_new().unwrap().records.is_empty());
        assert_eq!(t.offset(), 0);
    }

    #[test]
    fn truncation_resets_offset() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("errors.log");
        append(&log, &record("old one"));
        append(&log, &record("old two"));
        let mut t = tracker(&dir);
        t.read_new().unwrap();

        std::fs::write(&log, record("fresh")).unwrap();
        let batch = t.read_new().unwrap();
        assert!(batch.rotated);
        assert_eq!(batch.texts(), vec!["fresh"]);
        assert_eq!(t.offset(), std::fs::metadata(&log).unwrap().len());
    }

    #[test]
    fn offset_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("errors.log");
        append(&log, &record("seen"));
        {
            let mut t = tracker(&dir);
            t.read_new().unwrap();
        }
        append(&log, &record("unseen"));
        let mut t = tracker(&dir);
        assert_eq!(t.read_new().unwrap().texts(), vec!["unseen"]);
    }

    #[test]
    fn unhandled_records_are_read_again_after_reopen() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("errors.log");
        append(&log, &record("handled"));
        append(&log, &record("not handled"));
        {
            let mut t = tracker(&dir);
            let batch = t.peek_new().unwrap();
            assert_eq!(batch.texts(), vec!["handled", "not handled"]);
            t.advance_to(batch.records[0].end_offset).unwrap();
        }
        let mut t = tracker(&dir);
        assert_eq!(t.read_new().unwrap().texts(), vec!["not handled"]);
        assert!(t.read_new().unwrap().records.is_empty());
    }

    #[test]
    fn last_record_covers_trailing_empty_records() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("errors.log");
        append(&log, &record("only"));
        append(&log, &record(""));
        let mut t = tracker(&dir);
        let batch = t.peek_new().unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(
            batch.records[0].end_offset,
            std::fs::metadata(&log).unwrap().len()
        );
        assert_eq!(t.offset(), 0);
    }

    #[test]
    fn corrupt_state_starts_over() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(dir.path().join("state/cluster.json"), "{not json").unwrap();
        let t = tracker(&dir);
        assert_eq!(t.offset(), 0);
    }

    #[test]
    fn empty_records_are_dropped() {
        let (records, consumed) = split_complete_records(
            format!("{d}\n\n{d}\nx\n{d}\n", d = "---").as_bytes(),
            "---",
        );
        assert_eq!(records, vec![("x".to_string(), 15)]);
        assert_eq!(consumed, 15);
    }
}
