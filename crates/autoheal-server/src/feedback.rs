//! Feedback loop controller: remediate, verify, re-analyze with the failure
//! description, until fixed or out of retries.

use std::sync::Arc;

use autoheal_agent::Classifier;
use autoheal_core::config::FeedbackConfig;
use autoheal_core::ledger::AttemptDb;
use autoheal_core::types::{Analysis, AttemptOutcome, FixAttempt, Incident, IncidentId};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;

use crate::executor::Executor;
use crate::state::StatusBoard;
use crate::verifier::Verifier;

// ---------------------------------------------------------------------------
// LoopState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Detected,
    Analyzing,
    Remediating,
    Verifying,
    NeedsReanalysis,
    Fixed,
    /// Retry cap reached without a verified fix.
    Exhausted,
    /// Needs an operator: a resource was destroyed, or shutdown interrupted
    /// the loop.
    Escalated,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopState::Fixed | LoopState::Exhausted | LoopState::Escalated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoopState::Detected => "detected",
            LoopState::Analyzing => "analyzing",
            LoopState::Remediating => "remediating",
            LoopState::Verifying => "verifying",
            LoopState::NeedsReanalysis => "needs_reanalysis",
            LoopState::Fixed => "fixed",
            LoopState::Exhausted => "exhausted",
            LoopState::Escalated => "escalated",
        }
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final state of one controller run and every attempt it made.
#[derive(Debug, Clone)]
pub struct LoopReport {
    pub incident_id: IncidentId,
    pub state: LoopState,
    pub attempts: Vec<FixAttempt>,
}

// ---------------------------------------------------------------------------
// FeedbackLoop
// ---------------------------------------------------------------------------

pub struct FeedbackLoop {
    classifier: Classifier,
    executor: Executor,
    verifier: Verifier,
    ledger: Option<Arc<AttemptDb>>,
    config: FeedbackConfig,
    status: StatusBoard,
}

impl FeedbackLoop {
    pub fn new(
        classifier: Classifier,
        executor: Executor,
        verifier: Verifier,
        ledger: Option<Arc<AttemptDb>>,
        config: FeedbackConfig,
        status: StatusBoard,
    ) -> Self {
        Self {
            classifier,
            executor,
            verifier,
            ledger,
            config,
            status,
        }
    }

    /// Total attempts allowed per incident.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.max(1)
    }

    /// Drive `incident` from its first analysis to a terminal state.
    ///
    /// Shutdown is only observed between attempts, never inside the executor,
    /// so a delete is always followed by its recreate.
    pub async fn run(
        &self,
        incident: &Incident,
        analysis: Analysis,
        mut shutdown: watch::Receiver<bool>,
    ) -> LoopReport {
        let mut analysis = analysis;
        let mut attempts: Vec<FixAttempt> = Vec::new();
        let mut feedback: Vec<String> = Vec::new();
        let max = self.max_attempts();
        let mut n = 1u32;

        let state = loop {
            self.enter(incident, LoopState::Remediating, n);
            let mut attempt = self.executor.execute(incident, &analysis, n).await;

            if attempt.outcome == AttemptOutcome::Success {
                self.enter(incident, LoopState::Verifying, n);
                attempt.verification_result = self.verifier.verify(incident, &attempt).await;
            }
            attempt.finished_at = Utc::now();
            self.record(&attempt).await;

            let fixed = attempt.is_fixed();
            let destroyed = !attempt.destroyed.is_empty();
            if !fixed {
                feedback.push(attempt.failure_summary());
            }
            attempts.push(attempt);

            if fixed {
                break LoopState::Fixed;
            }
            if destroyed {
                tracing::error!(
                    incident = %incident.id,
                    attempt = n,
                    "remediation destroyed a resource, escalating without retry"
                );
                break LoopState::Escalated;
            }
            if n >= max {
                break LoopState::Exhausted;
            }

            self.enter(incident, LoopState::NeedsReanalysis, n);
            let delay = self.config.backoff(n);
            tracing::info!(
                incident = %incident.id,
                attempt = n,
                delay_ms = delay.as_millis() as u64,
                "remediation not verified, re-analyzing after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break LoopState::Escalated,
            }

            self.enter(incident, LoopState::Analyzing, n);
            let context = feedback.join("\n\n");
            analysis = tokio::select! {
                a = self.classifier.analyze(incident, Some(&context)) => a,
                _ = wait_for_shutdown(&mut shutdown) => break LoopState::Escalated,
            };
            n += 1;
        };

        self.enter(incident, state, n);
        match state {
            LoopState::Fixed => {
                tracing::info!(incident = %incident.id, attempts = n, "incident fixed")
            }
            LoopState::Exhausted => tracing::warn!(
                incident = %incident.id,
                attempts = n,
                "retry cap reached without a verified fix"
            ),
            _ => tracing::warn!(incident = %incident.id, attempts = n, state = %state, "incident escalated"),
        }

        LoopReport {
            incident_id: incident.id.clone(),
            state,
            attempts,
        }
    }

    fn enter(&self, incident: &Incident, state: LoopState, attempt: u32) {
        tracing::debug!(incident = %incident.id, attempt, state = %state, "loop state");
        self.status.transition(incident, state, attempt);
    }

    async fn record(&self, attempt: &FixAttempt) {
        self.status.attempt_recorded();
        let Some(ledger) = self.ledger.clone() else {
            return;
        };
        let owned = attempt.clone();
        let result = tokio::task::spawn_blocking(move || ledger.record(&owned)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                incident = %attempt.incident_id,
                error = %e,
                "could not record fix attempt"
            ),
            Err(e) => tracing::warn!(error = %e, "attempt ledger task failed"),
        }
    }
}

/// Resolves once shutdown has been requested. Never resolves if the sender is
/// dropped without requesting it.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
