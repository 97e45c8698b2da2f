//! Remediation queue: a bounded FIFO of completed analyses and the dispatcher
//! that drains it.
//!
//! The dispatcher runs at most one controller per incident id and at most
//! `max_concurrent` controllers overall. Handoffs that cannot start yet wait
//! in arrival order; a waiting handoff never overtakes an earlier one for the
//! same id. At most `capacity` handoffs wait inside the dispatcher and at most
//! `capacity` more sit in the channel, so senders block once both are full.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use autoheal_core::types::{Analysis, Incident, IncidentId};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};

use crate::feedback::{wait_for_shutdown, FeedbackLoop, LoopReport, LoopState};

/// A completed analysis on its way to the executor.
#[derive(Debug, Clone)]
pub struct Handoff {
    pub incident: Incident,
    pub analysis: Analysis,
}

pub fn channel(capacity: usize) -> (mpsc::Sender<Handoff>, mpsc::Receiver<Handoff>) {
    mpsc::channel(capacity.max(1))
}

/// Totals for one dispatcher run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub fixed: usize,
    pub exhausted: usize,
    pub escalated: usize,
    /// Handoffs still waiting when shutdown was requested.
    pub abandoned: usize,
}

impl DispatchSummary {
    fn count(&mut self, report: &LoopReport) {
        match report.state {
            LoopState::Fixed => self.fixed += 1,
            LoopState::Exhausted => self.exhausted += 1,
            _ => self.escalated += 1,
        }
    }
}

/// Incident id paired with its controller's outcome. The controller runs in
/// its own task so a panic still reports which id to release.
type Finished = (IncidentId, Result<LoopReport, JoinError>);

fn finish(
    joined: Result<Finished, JoinError>,
    in_flight: &mut HashSet<IncidentId>,
    summary: &mut DispatchSummary,
) {
    match joined {
        Ok((id, result)) => {
            in_flight.remove(&id);
            match result {
                Ok(report) => summary.count(&report),
                Err(e) => {
                    tracing::error!(incident = %id, error = %e, "remediation task failed");
                    summary.escalated += 1;
                }
            }
        }
        Err(e) => tracing::error!(error = %e, "remediation dispatch task failed"),
    }
}

pub struct Dispatcher {
    rx: mpsc::Receiver<Handoff>,
    controller: Arc<FeedbackLoop>,
    capacity: usize,
    max_concurrent: usize,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        rx: mpsc::Receiver<Handoff>,
        controller: Arc<FeedbackLoop>,
        capacity: usize,
        max_concurrent: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            rx,
            controller,
            capacity: capacity.max(1),
            max_concurrent: max_concurrent.max(1),
            shutdown,
        }
    }

    /// Run until every sender is gone and all work has finished, or until
    /// shutdown. On shutdown, in-flight controllers are awaited (they stop at
    /// their next checkpoint) and waiting handoffs are dropped.
    pub async fn run(mut self) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let mut waiting: VecDeque<Handoff> = VecDeque::new();
        let mut in_flight: HashSet<IncidentId> = HashSet::new();
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut open = true;
        let mut shutdown = self.shutdown.clone();

        loop {
            if !open && tasks.is_empty() && waiting.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    finish(joined, &mut in_flight, &mut summary);
                }
                msg = self.rx.recv(), if open && waiting.len() < self.capacity => match msg {
                    Some(handoff) => {
                        tracing::debug!(
                            incident = %handoff.incident.id,
                            waiting = waiting.len(),
                            "handoff received"
                        );
                        waiting.push_back(handoff);
                    }
                    None => open = false,
                },
            }
            self.start_ready(&mut waiting, &mut in_flight, &mut tasks);
        }

        self.rx.close();
        summary.abandoned = waiting.len();
        while self.rx.try_recv().is_ok() {
            summary.abandoned += 1;
        }
        if summary.abandoned > 0 {
            tracing::warn!(
                abandoned = summary.abandoned,
                "shutdown with remediations still queued"
            );
        }
        while let Some(joined) = tasks.join_next().await {
            finish(joined, &mut in_flight, &mut summary);
        }
        summary
    }

    fn start_ready(
        &self,
        waiting: &mut VecDeque<Handoff>,
        in_flight: &mut HashSet<IncidentId>,
        tasks: &mut JoinSet<Finished>,
    ) {
        let mut i = 0;
        while tasks.len() < self.max_concurrent && i < waiting.len() {
            if in_flight.contains(&waiting[i].incident.id) {
                i += 1;
                continue;
            }
            let Some(handoff) = waiting.remove(i) else {
                break;
            };
            in_flight.insert(handoff.incident.id.clone());
            tracing::info!(
                incident = %handoff.incident.id,
                in_flight = in_flight.len(),
                "starting remediation"
            );
            let controller = self.controller.clone();
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                let id = handoff.incident.id.clone();
                let run = tokio::spawn(async move {
                    controller
                        .run(&handoff.incident, handoff.analysis, shutdown)
                        .await
                });
                (id, run.await)
            });
        }
    }
}
