//! Persistent record of fix attempts using redb.
//!
//! # Table design
//!
//! A single `ATTEMPTS` table uses a 24-byte composite key:
//! ```text
//! [ started_at_ms: u64 big-endian (8 bytes) | attempt uuid: 16 bytes ]
//! ```
//!
//! Big-endian timestamps in the high bytes make key order equal start order,
//! so "most recent N" is a reverse scan with no sorting.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use uuid::Uuid;

use crate::error::{HealError, Result};
use crate::types::{FixAttempt, IncidentId};

/// Key: 24-byte composite (started_at_ms big-endian ++ uuid bytes)
/// Value: JSON-encoded FixAttempt
const ATTEMPTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("attempts");

fn attempt_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn db_err(e: impl std::fmt::Display) -> HealError {
    HealError::Ledger(e.to_string())
}

pub struct AttemptDb {
    db: Database,
}

impl AttemptDb {
    /// Open or create the ledger at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(ATTEMPTS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    pub fn record(&self, attempt: &FixAttempt) -> Result<()> {
        let key = attempt_key(attempt.started_at, attempt.id);
        let value = serde_json::to_vec(attempt).map_err(db_err)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(ATTEMPTS).map_err(db_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// Up to `limit` attempts, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<FixAttempt>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(ATTEMPTS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)?.rev().take(limit) {
            let (_, v) = entry.map_err(db_err)?;
            let attempt: FixAttempt = serde_json::from_slice(v.value()).map_err(db_err)?;
            result.push(attempt);
        }
        Ok(result)
    }

    /// Every attempt for `incident`, oldest first.
    pub fn for_incident(&self, incident: &IncidentId) -> Result<Vec<FixAttempt>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(ATTEMPTS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let attempt: FixAttempt = serde_json::from_slice(v.value()).map_err(db_err)?;
            if &attempt.incident_id == incident {
                result.push(attempt);
            }
        }
        Ok(result)
    }

    pub fn count(&self) -> Result<u64> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(ATTEMPTS).map_err(db_err)?;
        table.len().map_err(db_err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttemptOutcome;
    use chrono::Duration;
    use tempfile::TempDir;

    fn attempt(incident: &str, n: u32, offset_secs: i64) -> FixAttempt {
        let mut a = FixAttempt::begin(IncidentId::new(incident), n, "cause");
        a.started_at = Utc::now() + Duration::seconds(offset_secs);
        a.finished_at = a.started_at;
        a
    }

    #[test]
    fn recent_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let db = AttemptDb::open(&dir.path().join("ledger/attempts.redb")).unwrap();
        db.record(&attempt("a", 1, 0)).unwrap();
        db.record(&attempt("b", 1, 10)).unwrap();
        db.record(&attempt("a", 2, 20)).unwrap();

        let recent = db.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].incident_id.as_str(), "a");
        assert_eq!(recent[0].attempt, 2);
        assert_eq!(recent[1].incident_id.as_str(), "b");
        assert_eq!(db.count().unwrap(), 3);
    }

    #[test]
    fn for_incident_filters_and_orders() {
        let dir = TempDir::new().unwrap();
        let db = AttemptDb::open(&dir.path().join("attempts.redb")).unwrap();
        db.record(&attempt("a", 1, 0)).unwrap();
        db.record(&attempt("b", 1, 5)).unwrap();
        let mut second = attempt("a", 2, 10);
        second.outcome = AttemptOutcome::Success;
        db.record(&second).unwrap();

        let history = db.for_incident(&IncidentId::new("a")).unwrap();
        assert_eq!(history.iter().map(|a| a.attempt).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(history[1].outcome, AttemptOutcome::Success);
    }

    #[test]
    fn reopen_keeps_attempts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attempts.redb");
        {
            let db = AttemptDb::open(&path).unwrap();
            db.record(&attempt("a", 1, 0)).unwrap();
        }
        let db = AttemptDb::open(&path).unwrap();
        assert_eq!(db.recent(10).unwrap().len(), 1);
    }
}
