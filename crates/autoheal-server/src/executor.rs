//! Remediation executor: applies an analysis action by action.

use std::sync::Arc;

use autoheal_core::config::TimeoutConfig;
use autoheal_core::gate::{check_sql_grant, Verdict};
use autoheal_core::resources::prepare_recreate;
use autoheal_core::types::{
    Action, Analysis, AttemptOutcome, FixAttempt, Incident, PatchSpec, ResourceRef, SkippedAction,
};
use chrono::Utc;

use crate::backend::{Orchestrator, Warehouse};
use crate::error::{with_timeout, ServerError};

/// What happened to one action.
enum StepResult {
    Executed,
    Skipped(String),
    /// Hard failure; `destroyed` is set when the resource was deleted and
    /// could not be recreated.
    Failed {
        error: ServerError,
        side_effect: bool,
        destroyed: Option<ResourceRef>,
    },
}

pub struct Executor {
    warehouse: Arc<dyn Warehouse>,
    orchestrator: Arc<dyn Orchestrator>,
    timeouts: TimeoutConfig,
}

impl Executor {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        orchestrator: Arc<dyn Orchestrator>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            warehouse,
            orchestrator,
            timeouts,
        }
    }

    /// Run `analysis` for `incident` as attempt number `attempt`.
    ///
    /// Actions run in order; the first hard failure aborts the rest. The
    /// returned attempt has `verification_result` still `NotRun`.
    pub async fn execute(&self, incident: &Incident, analysis: &Analysis, attempt: u32) -> FixAttempt {
        let mut record = FixAttempt::begin(incident.id.clone(), attempt, &analysis.root_cause);
        let mut side_effects = false;

        for action in &analysis.remediation_steps {
            match self.step(action).await {
                StepResult::Executed => {
                    tracing::info!(
                        incident = %incident.id,
                        attempt,
                        action = %action.describe(),
                        "action executed"
                    );
                    side_effects = true;
                    record.actions_executed.push(action.clone());
                }
                StepResult::Skipped(reason) => {
                    tracing::warn!(
                        incident = %incident.id,
                        attempt,
                        action = %action.describe(),
                        reason = %reason,
                        "action skipped"
                    );
                    record.actions_skipped.push(SkippedAction {
                        action: action.clone(),
                        reason,
                    });
                }
                StepResult::Failed {
                    error,
                    side_effect,
                    destroyed,
                } => {
                    side_effects |= side_effect;
                    if let Some(resource) = destroyed {
                        tracing::error!(
                            incident = %incident.id,
                            attempt,
                            resource = %resource,
                            error = %error,
                            "resource deleted but not recreated"
                        );
                        record.destroyed.push(resource);
                    } else {
                        tracing::warn!(
                            incident = %incident.id,
                            attempt,
                            action = %action.describe(),
                            error = %error,
                            retryable = error.is_retryable(),
                            "action failed, aborting remaining actions"
                        );
                    }
                    record.failure = Some(format!("{}: {error}", action.describe()));
                    break;
                }
            }
        }

        record.outcome = match (&record.failure, side_effects) {
            (None, true) => AttemptOutcome::Success,
            (Some(_), true) => AttemptOutcome::PartialFailure,
            _ => AttemptOutcome::Failed,
        };
        if record.failure.is_none() && record.actions_executed.is_empty() {
            record.failure = Some("no executable remediation steps".to_string());
        }
        record.finished_at = Utc::now();
        record
    }

    async fn step(&self, action: &Action) -> StepResult {
        match action {
            Action::RawCommand { .. } => {
                StepResult::Skipped("raw commands are never executed".to_string())
            }
            Action::SqlGrant { command } => match check_sql_grant(command) {
                Verdict::Rejected(reason) => StepResult::Skipped(reason),
                Verdict::Allowed => {
                    let run = with_timeout(
                        "warehouse query",
                        self.timeouts.warehouse(),
                        self.warehouse.execute(command),
                    )
                    .await;
                    match run {
                        Ok(_) => StepResult::Executed,
                        // A timed-out statement may still have been applied.
                        Err(error @ ServerError::Timeout { .. }) => StepResult::Failed {
                            error,
                            side_effect: true,
                            destroyed: None,
                        },
                        Err(error) => StepResult::Failed {
                            error,
                            side_effect: false,
                            destroyed: None,
                        },
                    }
                }
            },
            Action::OrchestratorPatch { resource, patch } => self.patch(resource, patch).await,
        }
    }

    /// Fetch, transform, delete, recreate. A failed recreate after a
    /// successful delete reports the resource as destroyed.
    async fn patch(&self, resource: &ResourceRef, patch: &PatchSpec) -> StepResult {
        let Some(container) = resource.container.as_deref() else {
            return StepResult::Skipped(format!("{resource} names no container to patch"));
        };
        let PatchSpec::ScaleResources { factor } = patch;
        let timeout = self.timeouts.orchestrator();

        let spec = match with_timeout(
            "orchestrator get",
            timeout,
            self.orchestrator.get_spec(resource),
        )
        .await
        {
            Ok(spec) => spec,
            Err(error) => {
                return StepResult::Failed {
                    error,
                    side_effect: false,
                    destroyed: None,
                }
            }
        };

        let (manifest, changes) = match prepare_recreate(&spec, container, *factor) {
            Ok(prepared) => prepared,
            Err(e) => {
                return StepResult::Failed {
                    error: e.into(),
                    side_effect: false,
                    destroyed: None,
                }
            }
        };
        for change in &changes {
            tracing::info!(
                resource = %resource,
                kind = %change.resource,
                previous_limit = change.previous_limit.as_deref().unwrap_or("-"),
                limit = %change.limit,
                request = %change.request,
                "scaling container resources"
            );
        }

        if let Err(error) =
            with_timeout("orchestrator delete", timeout, self.orchestrator.delete(resource)).await
        {
            let side_effect = matches!(error, ServerError::Timeout { .. });
            return StepResult::Failed {
                error,
                side_effect,
                destroyed: None,
            };
        }

        match with_timeout("orchestrator apply", timeout, self.orchestrator.apply(&manifest)).await
        {
            Ok(()) => StepResult::Executed,
            Err(error) => StepResult::Failed {
                error,
                side_effect: true,
                destroyed: Some(resource.clone()),
            },
        }
    }
}
