use std::sync::Arc;
use std::time::Duration;

use autoheal_core::analysis::parse_response;
use autoheal_core::types::{Analysis, Incident};

use crate::prompt::build_request;
use crate::provider::CompletionProvider;
use crate::{AgentError, Result};

// ─── Classifier ───────────────────────────────────────────────────────────

/// Root-cause classifier: one completion call per analysis, parsed into an
/// [`Analysis`]. Never fails; every failure mode degrades to an inert step.
#[derive(Clone)]
pub struct Classifier {
    provider: Arc<dyn CompletionProvider>,
    timeout: Duration,
}

impl Classifier {
    pub fn new(provider: Arc<dyn CompletionProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// The raw completion for `incident`, bounded by the configured timeout.
    pub async fn complete(&self, incident: &Incident, feedback: Option<&str>) -> Result<String> {
        let request = build_request(incident, feedback);
        match tokio::time::timeout(self.timeout, self.provider.complete(&request)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(self.timeout)),
        }
    }

    pub async fn analyze(&self, incident: &Incident, feedback: Option<&str>) -> Analysis {
        tracing::info!(
            incident = %incident.id,
            provider = self.provider.name(),
            with_feedback = feedback.is_some(),
            "requesting analysis"
        );
        let raw = match self.complete(incident, feedback).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    incident = %incident.id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "analysis service failed, degrading to inert analysis"
                );
                return Analysis::unparseable(format!("analysis service error: {e}"));
            }
        };
        tracing::debug!(incident = %incident.id, response = %raw, "analysis response");

        let analysis = parse_response(&raw, incident);
        tracing::info!(
            incident = %incident.id,
            root_cause = %analysis.root_cause,
            steps = analysis.remediation_steps.len(),
            "analysis complete"
        );
        analysis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::CompletionRequest;
    use async_trait::async_trait;
    use autoheal_core::types::{Action, ExtractedFields};
    use std::sync::Mutex;

    struct Canned {
        reply: std::result::Result<String, String>,
        delay: Duration,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl Canned {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reply.clone().map_err(AgentError::Process)
        }
    }

    fn incident() -> Incident {
        Incident::new(
            "query-history",
            "ERROR_CODE: 003001",
            ExtractedFields::Warehouse {
                object_name: Some("DB.S.T".into()),
                error_code: Some("003001".into()),
                error_message: None,
                query_id: None,
            },
            None,
        )
    }

    #[tokio::test]
    async fn parses_fenced_response() {
        let provider = Canned::ok(
            "```json\n{\"root_cause\": \"missing grant\", \"remediation_steps\": [\"GRANT SELECT ON TABLE DB.S.T TO ROLE R;\"]}\n```",
        );
        let c = Classifier::new(provider.clone(), Duration::from_secs(5));
        let a = c.analyze(&incident(), Some("earlier attempt failed")).await;
        assert_eq!(a.root_cause, "missing grant");
        assert!(matches!(a.remediation_steps[0], Action::SqlGrant { .. }));
        let seen = provider.seen.lock().unwrap();
        assert!(seen[0].prompt.contains("earlier attempt failed"));
    }

    #[tokio::test]
    async fn provider_error_degrades() {
        let provider = Arc::new(Canned {
            reply: Err("connection refused".into()),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        });
        let a = Classifier::new(provider, Duration::from_secs(5))
            .analyze(&incident(), None)
            .await;
        assert!(a.is_unparseable());
        match &a.remediation_steps[..] {
            [Action::RawCommand { command }] => assert!(command.contains("connection refused")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_degrades() {
        let provider = Arc::new(Canned {
            reply: Ok("{}".into()),
            delay: Duration::from_secs(5),
            seen: Mutex::new(Vec::new()),
        });
        let c = Classifier::new(provider, Duration::from_millis(20));
        let err = c.complete(&incident(), None).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
        assert!(err.is_retryable());
        assert!(c.analyze(&incident(), None).await.is_unparseable());
    }

    #[tokio::test]
    async fn garbage_degrades() {
        let c = Classifier::new(Canned::ok("no idea, sorry"), Duration::from_secs(5));
        let a = c.analyze(&incident(), None).await;
        assert!(a.is_unparseable());
        assert_eq!(
            a.remediation_steps,
            vec![Action::RawCommand {
                command: "no idea, sorry".into()
            }]
        );
    }
}
