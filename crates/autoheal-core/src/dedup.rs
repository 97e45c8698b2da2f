use crate::types::TelemetryEvent;
use std::collections::HashMap;

/// Event ids seen by one telemetry source, remembered for a retention window.
///
/// Owned by the source's polling loop; never shared.
#[derive(Debug, Clone)]
pub struct DedupState {
    window_ms: i64,
    seen: HashMap<String, i64>,
}

impl DedupState {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            seen: HashMap::new(),
        }
    }

    /// Record `event_id`. Returns true if it was not already known.
    pub fn insert(&mut self, event_id: &str, timestamp_ms: i64) -> bool {
        match self.seen.get_mut(event_id) {
            Some(ts) => {
                *ts = (*ts).max(timestamp_ms);
                false
            }
            None => {
                self.seen.insert(event_id.to_string(), timestamp_ms);
                true
            }
        }
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.seen.contains_key(event_id)
    }

    /// Keep only events not yet seen, preserving their order, and remember them.
    pub fn filter_new(&mut self, events: Vec<TelemetryEvent>) -> Vec<TelemetryEvent> {
        events
            .into_iter()
            .filter(|e| self.insert(&e.event_id, e.timestamp))
            .collect()
    }

    /// Forget entries older than the window ending at `now_ms`. Returns how
    /// many were removed.
    pub fn prune(&mut self, now_ms: i64) -> usize {
        let cutoff = now_ms - self.window_ms;
        let before = self.seen.len();
        self.seen.retain(|_, ts| *ts >= cutoff);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
