//! Event window scanning and the per-source record readers built on it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use autoheal_core::config::{Feed, SourceConfig};
use autoheal_core::cursor::CursorTracker;
use autoheal_core::dedup::DedupState;
use autoheal_core::extract::ErrorFilter;
use autoheal_core::paths;
use autoheal_core::types::{SourceKind, TelemetryEvent};

use crate::backend::{HttpTelemetry, TelemetrySource};
use crate::error::{with_timeout, Result};

// ---------------------------------------------------------------------------
// EventWindowScanner
// ---------------------------------------------------------------------------

/// Polls a telemetry source for the trailing window and forgets event ids once
/// they fall out of it.
pub struct EventWindowScanner {
    source_id: String,
    telemetry: Arc<dyn TelemetrySource>,
    window: Duration,
    timeout: Duration,
    dedup: DedupState,
    filter: ErrorFilter,
}

impl EventWindowScanner {
    pub fn new(
        source_id: impl Into<String>,
        telemetry: Arc<dyn TelemetrySource>,
        window: Duration,
        timeout: Duration,
        filter: ErrorFilter,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            telemetry,
            window,
            timeout,
            dedup: DedupState::new(window.as_millis() as i64),
            filter,
        }
    }

    /// Events in `[now_ms - window, now_ms]` that were not returned before and
    /// look like errors.
    pub async fn poll(&mut self, now_ms: i64) -> Result<Vec<TelemetryEvent>> {
        let start_ms = now_ms - self.window.as_millis() as i64;
        let events = with_timeout(
            "telemetry fetch",
            self.timeout,
            self.telemetry.fetch(start_ms, now_ms),
        )
        .await?;
        let fetched = events.len();

        let fresh = self.dedup.filter_new(events);
        let new = fresh.len();
        let errors: Vec<TelemetryEvent> = fresh
            .into_iter()
            .filter(|e| self.filter.is_error(&e.message))
            .collect();
        let pruned = self.dedup.prune(now_ms);

        tracing::debug!(
            source = %self.source_id,
            fetched,
            new,
            errors = errors.len(),
            pruned,
            remembered = self.dedup.len(),
            "telemetry window scanned"
        );
        Ok(errors)
    }

    pub fn remembered(&self) -> usize {
        self.dedup.len()
    }
}

// ---------------------------------------------------------------------------
// SourceReader
// ---------------------------------------------------------------------------

/// One raw error record ready for extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub text: String,
    pub event_id: Option<String>,
    /// Log offset to commit once the record is handled. Telemetry records
    /// carry none; the dedup window covers them.
    pub end_offset: Option<u64>,
}

enum Reader {
    Window(EventWindowScanner),
    Log {
        tracker: CursorTracker,
        /// Set only when the source configures `error_pattern`; the log
        /// writer records errors only.
        filter: Option<ErrorFilter>,
    },
}

/// Yields new raw records for one configured source.
pub struct SourceReader {
    pub id: String,
    pub kind: SourceKind,
    pub poll_interval: Duration,
    reader: Reader,
}

impl SourceReader {
    /// Build the reader for `source`. Telemetry feeds use `telemetry` when
    /// given, otherwise the HTTP adapter for the configured endpoint.
    pub fn open(
        root: &Path,
        source: &SourceConfig,
        poll_interval: Duration,
        timeout: Duration,
        telemetry: Option<Arc<dyn TelemetrySource>>,
    ) -> Result<Self> {
        let reader = match &source.feed {
            Feed::Telemetry {
                endpoint,
                window_secs,
            } => {
                let filter = ErrorFilter::for_source(source.kind, source.error_pattern.as_deref())?;
                let telemetry =
                    telemetry.unwrap_or_else(|| Arc::new(HttpTelemetry::new(endpoint.clone())));
                Reader::Window(EventWindowScanner::new(
                    &source.id,
                    telemetry,
                    Duration::from_secs(*window_secs),
                    timeout,
                    filter,
                ))
            }
            Feed::LogFile { path, delimiter } => Reader::Log {
                tracker: CursorTracker::open(
                    &source.id,
                    paths::resolve(root, path),
                    paths::cursor_path(root, &source.id),
                    delimiter.clone(),
                )?,
                filter: source
                    .error_pattern
                    .as_deref()
                    .map(|p| ErrorFilter::for_source(source.kind, Some(p)))
                    .transpose()?,
            },
        };
        Ok(Self {
            id: source.id.clone(),
            kind: source.kind,
            poll_interval,
            reader,
        })
    }

    pub fn feed_name(&self) -> &'static str {
        match self.reader {
            Reader::Window(_) => "telemetry",
            Reader::Log { .. } => "log_file",
        }
    }

    /// Records that arrived since the previous call, in arrival order.
    ///
    /// Log records are returned again on the next call (or after a restart)
    /// until [`SourceReader::acknowledge`] commits their offset.
    pub async fn next_records(&mut self, now_ms: i64) -> Result<Vec<RawRecord>> {
        match &mut self.reader {
            Reader::Window(scanner) => Ok(scanner
                .poll(now_ms)
                .await?
                .into_iter()
                .map(|e| RawRecord {
                    text: e.record_text(),
                    event_id: Some(e.event_id),
                    end_offset: None,
                })
                .collect()),
            Reader::Log { tracker, filter } => {
                let batch = tracker.peek_new()?;
                if batch.pending_bytes > 0 {
                    tracing::trace!(
                        source = %self.id,
                        pending = batch.pending_bytes,
                        "partial record left for the next read"
                    );
                }
                let Some(batch_end) = batch.records.last().map(|r| r.end_offset) else {
                    return Ok(Vec::new());
                };

                let read = batch.records.len();
                let mut records: Vec<RawRecord> = batch
                    .records
                    .into_iter()
                    .filter(|r| filter.as_ref().map_or(true, |f| f.is_error(&r.text)))
                    .map(|r| RawRecord {
                        text: r.text,
                        event_id: None,
                        end_offset: Some(r.end_offset),
                    })
                    .collect();
                if records.len() < read {
                    tracing::debug!(
                        source = %self.id,
                        read,
                        errors = records.len(),
                        "log records filtered by error_pattern"
                    );
                }
                // Filtered records after the last kept one are committed with it.
                match records.last_mut() {
                    Some(last) => last.end_offset = Some(batch_end),
                    None => tracker.advance_to(batch_end)?,
                }
                Ok(records)
            }
        }
    }

    /// Commit a handled record. A no-op for telemetry records.
    pub fn acknowledge(&mut self, end_offset: Option<u64>) -> Result<()> {
        match (&mut self.reader, end_offset) {
            (Reader::Log { tracker, .. }, Some(offset)) => Ok(tracker.advance_to(offset)?),
            _ => Ok(()),
        }
    }
}
