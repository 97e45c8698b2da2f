use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use autoheal_core::ledger::AttemptDb;
use autoheal_core::types::{Incident, IncidentId, SourceKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::feedback::LoopState;

/// Terminal incidents kept for `/api/status`.
const RECENT_LIMIT: usize = 50;

// ---------------------------------------------------------------------------
// Status board
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    Starting,
    Healthy,
    /// The last poll failed; the loop is backing off.
    Degraded,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub kind: SourceKind,
    pub feed: String,
    pub health: SourceHealth,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub records: u64,
    pub incidents: u64,
    pub unextractable: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentStatus {
    pub id: IncidentId,
    pub source_id: String,
    pub state: LoopState,
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Counters {
    pub incidents: u64,
    pub unextractable: u64,
    pub handoffs: u64,
    pub attempts: u64,
    pub fixed: u64,
    pub exhausted: u64,
    pub escalated: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub started_at: DateTime<Utc>,
    pub stopping: bool,
    pub sources: Vec<SourceStatus>,
    pub active: Vec<IncidentStatus>,
    pub recent: Vec<IncidentStatus>,
    pub counters: Counters,
}

struct Board {
    started_at: DateTime<Utc>,
    stopping: bool,
    sources: BTreeMap<String, SourceStatus>,
    active: BTreeMap<IncidentId, IncidentStatus>,
    recent: VecDeque<IncidentStatus>,
    counters: Counters,
}

/// Live pipeline status shared by the source loops, the controllers and the
/// HTTP handlers. Writers only touch it between awaits.
#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<Mutex<Board>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Board {
                started_at: Utc::now(),
                stopping: false,
                sources: BTreeMap::new(),
                active: BTreeMap::new(),
                recent: VecDeque::new(),
                counters: Counters::default(),
            })),
        }
    }
}

impl StatusBoard {
    fn lock(&self) -> MutexGuard<'_, Board> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_source(&self, id: &str, f: impl FnOnce(&mut SourceStatus)) {
        if let Some(source) = self.lock().sources.get_mut(id) {
            f(source);
        }
    }

    pub fn register_source(&self, id: &str, kind: SourceKind, feed: &str) {
        self.lock().sources.insert(
            id.to_string(),
            SourceStatus {
                id: id.to_string(),
                kind,
                feed: feed.to_string(),
                health: SourceHealth::Starting,
                last_poll_at: None,
                consecutive_failures: 0,
                last_error: None,
                records: 0,
                incidents: 0,
                unextractable: 0,
            },
        );
    }

    pub fn poll_succeeded(&self, id: &str, records: usize) {
        self.with_source(id, |s| {
            s.health = SourceHealth::Healthy;
            s.last_poll_at = Some(Utc::now());
            s.consecutive_failures = 0;
            s.records += records as u64;
        });
    }

    /// Returns the number of consecutive failures including this one.
    pub fn poll_failed(&self, id: &str, error: &str) -> u32 {
        let mut failures = 1;
        self.with_source(id, |s| {
            s.health = SourceHealth::Degraded;
            s.last_poll_at = Some(Utc::now());
            s.consecutive_failures += 1;
            s.last_error = Some(error.to_string());
            failures = s.consecutive_failures;
        });
        failures
    }

    pub fn source_stopped(&self, id: &str) {
        self.with_source(id, |s| s.health = SourceHealth::Stopped);
    }

    pub fn incident_detected(&self, incident: &Incident) {
        let mut board = self.lock();
        board.counters.incidents += 1;
        if let Some(s) = board.sources.get_mut(&incident.source_id) {
            s.incidents += 1;
        }
    }

    pub fn unextractable(&self, source_id: &str) {
        let mut board = self.lock();
        board.counters.unextractable += 1;
        if let Some(s) = board.sources.get_mut(source_id) {
            s.unextractable += 1;
        }
    }

    pub fn handoff_queued(&self) {
        self.lock().counters.handoffs += 1;
    }

    pub fn attempt_recorded(&self) {
        self.lock().counters.attempts += 1;
    }

    pub fn transition(&self, incident: &Incident, state: LoopState, attempt: u32) {
        let status = IncidentStatus {
            id: incident.id.clone(),
            source_id: incident.source_id.clone(),
            state,
            attempt,
            updated_at: Utc::now(),
        };
        let mut board = self.lock();
        if !state.is_terminal() {
            board.active.insert(incident.id.clone(), status);
            return;
        }
        board.active.remove(&incident.id);
        match state {
            LoopState::Fixed => board.counters.fixed += 1,
            LoopState::Exhausted => board.counters.exhausted += 1,
            _ => board.counters.escalated += 1,
        }
        board.recent.push_front(status);
        board.recent.truncate(RECENT_LIMIT);
    }

    pub fn set_stopping(&self) {
        self.lock().stopping = true;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let board = self.lock();
        StatusSnapshot {
            started_at: board.started_at,
            stopping: board.stopping,
            sources: board.sources.values().cloned().collect(),
            active: board.active.values().cloned().collect(),
            recent: board.recent.iter().cloned().collect(),
            counters: board.counters.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub status: StatusBoard,
    pub ledger: Option<Arc<AttemptDb>>,
    pub shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(
        status: StatusBoard,
        ledger: Option<Arc<AttemptDb>>,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            status,
            ledger,
            shutdown,
        }
    }

    pub fn request_shutdown(&self) {
        self.status.set_stopping();
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoheal_core::types::ExtractedFields;

    fn incident(pod: &str) -> Incident {
        Incident::new(
            "cluster",
            "raw",
            ExtractedFields::Orchestrator {
                namespace: "ns1".into(),
                pod: pod.into(),
                container: "c1".into(),
                reason: "OOMKilled".into(),
            },
            None,
        )
    }

    #[test]
    fn terminal_transition_moves_incident_to_recent() {
        let board = StatusBoard::default();
        board.register_source("cluster", SourceKind::Orchestrator, "log_file");
        let inc = incident("p1");
        board.incident_detected(&inc);
        board.transition(&inc, LoopState::Remediating, 1);
        assert_eq!(board.snapshot().active.len(), 1);

        board.transition(&inc, LoopState::Fixed, 1);
        let snap = board.snapshot();
        assert!(snap.active.is_empty());
        assert_eq!(snap.recent.len(), 1);
        assert_eq!(snap.counters.fixed, 1);
        assert_eq!(snap.sources[0].incidents, 1);
    }

    #[test]
    fn poll_failures_degrade_until_success() {
        let board = StatusBoard::default();
        board.register_source("q", SourceKind::Warehouse, "telemetry");
        assert_eq!(board.poll_failed("q", "refused"), 1);
        assert_eq!(board.poll_failed("q", "refused"), 2);
        assert_eq!(board.snapshot().sources[0].health, SourceHealth::Degraded);
        board.poll_succeeded("q", 3);
        let s = &board.snapshot().sources[0];
        assert_eq!(s.health, SourceHealth::Healthy);
        assert_eq!(s.consecutive_failures, 0);
        assert_eq!(s.records, 3);
    }

    #[test]
    fn recent_is_bounded() {
        let board = StatusBoard::default();
        for i in 0..(RECENT_LIMIT + 5) {
            board.transition(&incident(&format!("p{i}")), LoopState::Exhausted, 3);
        }
        let snap = board.snapshot();
        assert_eq!(snap.recent.len(), RECENT_LIMIT);
        assert_eq!(snap.counters.exhausted, (RECENT_LIMIT + 5) as u64);
    }

    #[test]
    fn request_shutdown_flips_the_signal() {
        let (tx, rx) = watch::channel(false);
        let state = AppState::new(StatusBoard::default(), None, Arc::new(tx));
        state.request_shutdown();
        assert!(*rx.borrow());
        assert!(state.status.snapshot().stopping);
    }
}
