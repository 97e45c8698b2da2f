use std::sync::Arc;

use autoheal_core::config::TimeoutConfig;
use autoheal_core::gate::object_probe_sql;
use autoheal_core::types::{AttemptOutcome, FixAttempt, Incident, SourceKind, VerificationResult};

use crate::backend::{Orchestrator, Warehouse};
use crate::error::{with_timeout, Result, ServerError};

/// Post-remediation checks. A named object gets a targeted probe; anything
/// else falls back to a liveness probe of the backend.
pub struct Verifier {
    warehouse: Arc<dyn Warehouse>,
    orchestrator: Arc<dyn Orchestrator>,
    liveness_sql: String,
    timeouts: TimeoutConfig,
}

impl Verifier {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        orchestrator: Arc<dyn Orchestrator>,
        liveness_sql: impl Into<String>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            warehouse,
            orchestrator,
            liveness_sql: liveness_sql.into(),
            timeouts,
        }
    }

    pub async fn verify(&self, incident: &Incident, attempt: &FixAttempt) -> VerificationResult {
        if attempt.outcome != AttemptOutcome::Success {
            return VerificationResult::NotRun;
        }

        let (check, result) = match incident.source_kind {
            SourceKind::Warehouse => self.verify_warehouse(incident).await,
            SourceKind::Orchestrator => self.verify_orchestrator(incident).await,
        };
        match result {
            Ok(()) => {
                tracing::info!(incident = %incident.id, check = %check, "verification passed");
                VerificationResult::Passed { check }
            }
            Err(e) => {
                tracing::warn!(
                    incident = %incident.id,
                    check = %check,
                    error = %e,
                    "verification failed"
                );
                let err = ServerError::Verification(e.to_string());
                VerificationResult::Failed {
                    check,
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn verify_warehouse(&self, incident: &Incident) -> (String, Result<()>) {
        let timeout = self.timeouts.warehouse();
        let Some(object) = incident.object_name() else {
            let check = format!("liveness: {}", self.liveness_sql);
            let result = with_timeout(
                "warehouse liveness",
                timeout,
                self.warehouse.execute(&self.liveness_sql),
            )
            .await
            .map(|_| ());
            return (check, result);
        };

        let check = format!("object probe: {object}");
        let sql = match object_probe_sql(object) {
            Ok(sql) => sql,
            Err(e) => return (check, Err(e.into())),
        };
        let result = with_timeout("warehouse probe", timeout, self.warehouse.execute(&sql))
            .await
            .map(|_| ());
        (check, result)
    }

    async fn verify_orchestrator(&self, incident: &Incident) -> (String, Result<()>) {
        let timeout = self.timeouts.orchestrator();
        match incident.resource_ref() {
            Some(resource) => {
                let check = format!("fetch {resource}");
                let result = with_timeout(
                    "orchestrator get",
                    timeout,
                    self.orchestrator.get_spec(&resource),
                )
                .await
                .map(|_| ());
                (check, result)
            }
            None => {
                let result = with_timeout("orchestrator ping", timeout, self.orchestrator.ping())
                    .await;
                ("liveness: orchestrator ping".to_string(), result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::{
        oom_incident, oom_pod_spec, warehouse_incident, SpyOrchestrator, SpyWarehouse,
    };
    use autoheal_core::types::{ExtractedFields, IncidentId};
    use serde_json::json;

    fn verifier(wh: Arc<SpyWarehouse>, orch: Arc<SpyOrchestrator>) -> Verifier {
        Verifier::new(wh, orch, "SELECT 1;", TimeoutConfig::default())
    }

    fn succeeded(incident: &Incident) -> FixAttempt {
        let mut a = FixAttempt::begin(incident.id.clone(), 1, "x");
        a.outcome = AttemptOutcome::Success;
        a
    }

    #[tokio::test]
    async fn named_object_gets_targeted_probe() {
        let wh = Arc::new(SpyWarehouse::default());
        let incident = warehouse_incident();
        let result = verifier(wh.clone(), Arc::new(SpyOrchestrator::new(json!({}))))
            .verify(&incident, &succeeded(&incident))
            .await;
        assert!(result.is_passed());
        assert_eq!(
            *wh.calls.lock().unwrap(),
            vec!["SELECT 1 FROM DB.S.T LIMIT 1;"]
        );
    }

    #[tokio::test]
    async fn no_object_falls_back_to_liveness() {
        let wh = Arc::new(SpyWarehouse::default());
        let incident = Incident::new(
            "login-history",
            "ERROR_CODE: 390100",
            ExtractedFields::Warehouse {
                object_name: None,
                error_code: Some("390100".into()),
                error_message: None,
                query_id: None,
            },
            Some("evt-1"),
        );
        let result = verifier(wh.clone(), Arc::new(SpyOrchestrator::new(json!({}))))
            .verify(&incident, &succeeded(&incident))
            .await;
        assert_eq!(
            result,
            VerificationResult::Passed {
                check: "liveness: SELECT 1;".into()
            }
        );
        assert_eq!(*wh.calls.lock().unwrap(), vec!["SELECT 1;"]);
    }

    #[tokio::test]
    async fn failing_probe_reports_reason() {
        let wh = Arc::new(SpyWarehouse {
            fail_on: Some("DB.S.T".into()),
            ..Default::default()
        });
        let incident = warehouse_incident();
        let result = verifier(wh, Arc::new(SpyOrchestrator::new(json!({}))))
            .verify(&incident, &succeeded(&incident))
            .await;
        match result {
            VerificationResult::Failed { check, reason } => {
                assert!(check.contains("DB.S.T"));
                assert!(reason.starts_with("verification failed: "), "{reason}");
                assert!(reason.contains("rejected"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsafe_object_name_is_never_queried() {
        let wh = Arc::new(SpyWarehouse::default());
        let incident = Incident::new(
            "query-history",
            "raw",
            ExtractedFields::Warehouse {
                object_name: Some("t; DROP TABLE x".into()),
                error_code: None,
                error_message: None,
                query_id: None,
            },
            None,
        );
        let result = verifier(wh.clone(), Arc::new(SpyOrchestrator::new(json!({}))))
            .verify(&incident, &succeeded(&incident))
            .await;
        assert!(matches!(result, VerificationResult::Failed { .. }));
        assert!(wh.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn orchestrator_checks_the_resource() {
        let orch = Arc::new(SpyOrchestrator::new(oom_pod_spec()));
        let incident = oom_incident();
        let result = verifier(Arc::new(SpyWarehouse::default()), orch.clone())
            .verify(&incident, &succeeded(&incident))
            .await;
        assert!(result.is_passed());
        assert_eq!(orch.calls(), vec!["get p1 ns1"]);
    }

    #[tokio::test]
    async fn unsuccessful_attempts_are_not_verified() {
        let orch = Arc::new(SpyOrchestrator::new(oom_pod_spec()));
        let attempt = FixAttempt::begin(IncidentId::new("x"), 1, "x");
        let result = verifier(Arc::new(SpyWarehouse::default()), orch.clone())
            .verify(&oom_incident(), &attempt)
            .await;
        assert_eq!(result, VerificationResult::NotRun);
        assert!(orch.calls().is_empty());
    }
}
