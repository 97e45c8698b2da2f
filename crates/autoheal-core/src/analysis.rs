//! Parsing of analysis-service responses into [`Analysis`].
//!
//! The response is expected to be a JSON object shaped
//! `{"root_cause": "...", "remediation_steps": [...]}`, optionally wrapped in a
//! fenced code block. Parsing never fails: anything unusable becomes
//! [`Analysis::unparseable`].

use crate::types::{Action, Analysis, Incident, PatchSpec, SourceKind};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

static FENCE_RE: OnceLock<Regex> = OnceLock::new();

fn fence_re() -> &'static Regex {
    FENCE_RE.get_or_init(|| Regex::new(r"(?s)```[A-Za-z]*\s*(\{.*?\})\s*```").unwrap())
}

/// The body of the first fenced code block holding a JSON object, if any.
pub fn fenced_json(response: &str) -> Option<&str> {
    fence_re()
        .captures(response)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Parse a raw completion for `incident`.
pub fn parse_response(raw: &str, incident: &Incident) -> Analysis {
    let candidate = fenced_json(raw).unwrap_or_else(|| raw.trim());
    let value: Value = match serde_json::from_str(candidate) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(
                incident = %incident.id,
                error = %e,
                "analysis response is not JSON"
            );
            return Analysis::unparseable(raw);
        }
    };
    let Some(obj) = value.as_object() else {
        tracing::warn!(incident = %incident.id, "analysis response is not a JSON object");
        return Analysis::unparseable(raw);
    };

    let root_cause = obj
        .get("root_cause")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Unknown")
        .to_string();

    let remediation_steps = obj
        .get("remediation_steps")
        .and_then(Value::as_array)
        .map(|steps| {
            steps
                .iter()
                .filter_map(|s| step_to_action(s, incident))
                .collect()
        })
        .unwrap_or_default();

    Analysis {
        root_cause,
        remediation_steps,
    }
}

/// Map one response step onto an [`Action`]. SQL text only becomes a
/// `SqlGrant` candidate for warehouse incidents; everything the executor could
/// not act on safely is kept as an inert `RawCommand`.
fn step_to_action(step: &Value, incident: &Incident) -> Option<Action> {
    let command = match step {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Object(o) => o
            .get("command")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string()),
        _ => None,
    };

    if let Some(command) = command {
        if command.is_empty() {
            return None;
        }
        return Some(match incident.source_kind {
            SourceKind::Warehouse => Action::SqlGrant { command },
            SourceKind::Orchestrator => Action::RawCommand { command },
        });
    }

    let action = step.get("action").and_then(Value::as_str);
    match (action, incident.resource_ref()) {
        (Some("scale_resources"), Some(resource)) => {
            let factor = step
                .get("factor")
                .and_then(Value::as_u64)
                .and_then(|f| u32::try_from(f).ok())
                .filter(|f| (2..=4).contains(f))
                .unwrap_or(2);
            Some(Action::OrchestratorPatch {
                resource,
                patch: PatchSpec::ScaleResources { factor },
            })
        }
        _ => {
            tracing::warn!(incident = %incident.id, step = %step, "unrecognized remediation step");
            Some(Action::RawCommand {
                command: step.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExtractedFields, ResourceRef};

    fn warehouse_incident() -> Incident {
        Incident::new(
            "query-history",
            "raw",
            ExtractedFields::Warehouse {
                object_name: Some("SALES.PUBLIC.ORDERS".into()),
                error_code: Some("003001".into()),
                error_message: None,
                query_id: None,
            },
            Some("e1"),
        )
    }

    fn oom_incident() -> Incident {
        Incident::new(
            "cluster",
            "raw",
            ExtractedFields::Orchestrator {
                namespace: "ns1".into(),
                pod: "p1".into(),
                container: "c1".into(),
                reason: "OOMKilled".into(),
            },
            None,
        )
    }

    #[test]
    fn fenced_block_is_preferred() {
        let raw = "Here you go:\n```json\n{\"root_cause\": \"missing grant\", \"remediation_steps\": [\"GRANT SELECT ON TABLE SALES.PUBLIC.ORDERS TO ROLE ANALYST;\"]}\n```\nThanks";
        let a = parse_response(raw, &warehouse_incident());
        assert_eq!(a.root_cause, "missing grant");
        assert_eq!(
            a.remediation_steps,
            vec![Action::SqlGrant {
                command: "GRANT SELECT ON TABLE SALES.PUBLIC.ORDERS TO ROLE ANALYST;".into()
            }]
        );
    }

    #[test]
    fn bare_json_is_accepted() {
        let raw = r#"  {"root_cause": "x", "remediation_steps": [{"command": "SHOW GRANTS;"}]}  "#;
        let a = parse_response(raw, &warehouse_incident());
        assert_eq!(a.root_cause, "x");
        assert_eq!(
            a.remediation_steps,
            vec![Action::SqlGrant {
                command: "SHOW GRANTS;".into()
            }]
        );
    }

    #[test]
    fn prose_degrades_to_raw_command() {
        let raw = "I think you should grant the role access.";
        let a = parse_response(raw, &warehouse_incident());
        assert!(a.is_unparseable());
        assert_eq!(a.remediation_steps, vec![Action::RawCommand { command: raw.into() }]);
    }

    #[test]
    fn non_object_json_degrades() {
        assert!(parse_response("[1, 2, 3]", &warehouse_incident()).is_unparseable());
    }

    #[test]
    fn missing_fields_default() {
        let a = parse_response("{}", &warehouse_incident());
        assert_eq!(a.root_cause, "Unknown");
        assert!(a.remediation_steps.is_empty());
    }

    #[test]
    fn scale_step_targets_incident_container() {
        let raw = r#"{"root_cause": "memory limit too low", "remediation_steps": [{"action": "scale_resources"}]}"#;
        let a = parse_response(raw, &oom_incident());
        assert_eq!(
            a.remediation_steps,
            vec![Action::OrchestratorPatch {
                resource: ResourceRef::pod("ns1", "p1").with_container("c1"),
                patch: PatchSpec::ScaleResources { factor: 2 },
            }]
        );
    }

    #[test]
    fn out_of_range_factor_falls_back_to_two() {
        let raw = r#"{"root_cause": "oom", "remediation_steps": [{"action": "scale_resources", "factor": 50}]}"#;
        let a = parse_response(raw, &oom_incident());
        assert!(matches!(
            a.remediation_steps[0],
            Action::OrchestratorPatch {
                patch: PatchSpec::ScaleResources { factor: 2 },
                ..
            }
        ));
    }

    #[test]
    fn sql_text_for_orchestrator_is_inert() {
        let raw = r#"{"root_cause": "oom", "remediation_steps": ["kubectl delete ns prod"]}"#;
        let a = parse_response(raw, &oom_incident());
        assert_eq!(
            a.remediation_steps,
            vec![Action::RawCommand {
                command: "kubectl delete ns prod".into()
            }]
        );
    }

    #[test]
    fn scale_step_for_warehouse_is_inert() {
        let raw = r#"{"root_cause": "x", "remediation_steps": [{"action": "scale_resources"}, 42]}"#;
        let a = parse_response(raw, &warehouse_incident());
        assert_eq!(a.remediation_steps.len(), 2);
        assert!(a
            .remediation_steps
            .iter()
            .all(|s| matches!(s, Action::RawCommand { .. })));
    }
}
