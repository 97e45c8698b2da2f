use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SourceKind
// ---------------------------------------------------------------------------

/// The backend family an incident was reported by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Warehouse,
    Orchestrator,
}

impl SourceKind {
    pub fn all() -> &'static [SourceKind] {
        &[SourceKind::Warehouse, SourceKind::Orchestrator]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Warehouse => "warehouse",
            SourceKind::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = crate::error::HealError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warehouse" => Ok(SourceKind::Warehouse),
            "orchestrator" => Ok(SourceKind::Orchestrator),
            _ => Err(crate::error::HealError::InvalidSourceKind(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// TelemetryEvent
// ---------------------------------------------------------------------------

/// One event returned by a telemetry window query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(alias = "eventId")]
    pub event_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub message: String,
    /// Log group or stream the event came from, when the transport reports one.
    #[serde(default, alias = "logGroup", skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl TelemetryEvent {
    /// The record text handed to the extractor.
    pub fn record_text(&self) -> String {
        match &self.group {
            Some(g) => format!("Error in {g}:\n{}", self.message),
            None => self.message.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// IncidentId
// ---------------------------------------------------------------------------

/// Stable fingerprint of what an incident is about.
///
/// Two reports about the same pod container (or the same warehouse object)
/// share an id, so the remediation queue serializes them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncidentId(String);

impl IncidentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ResourceRef
// ---------------------------------------------------------------------------

/// Reference to an orchestrator resource, optionally narrowed to one container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default = "default_resource_kind")]
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

fn default_resource_kind() -> String {
    "pod".to_string()
}

impl ResourceRef {
    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: default_resource_kind(),
            namespace: namespace.into(),
            name: name.into(),
            container: None,
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)?;
        if let Some(c) = &self.container {
            write!(f, " (container {c})")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ExtractedFields
// ---------------------------------------------------------------------------

/// Identity fields pulled out of a raw error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractedFields {
    Warehouse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        object_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query_id: Option<String>,
    },
    Orchestrator {
        namespace: String,
        pod: String,
        container: String,
        reason: String,
    },
}

impl ExtractedFields {
    pub fn source_kind(&self) -> SourceKind {
        match self {
            ExtractedFields::Warehouse { .. } => SourceKind::Warehouse,
            ExtractedFields::Orchestrator { .. } => SourceKind::Orchestrator,
        }
    }
}

// ---------------------------------------------------------------------------
// Incident
// ---------------------------------------------------------------------------

/// One detected error occurrence. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub raw_text: String,
    pub detected_at: DateTime<Utc>,
    pub fields: ExtractedFields,
}

impl Incident {
    /// Build an incident from extracted fields. `event_id` is only used to
    /// fingerprint warehouse incidents that carry no object name.
    pub fn new(
        source_id: impl Into<String>,
        raw_text: impl Into<String>,
        fields: ExtractedFields,
        event_id: Option<&str>,
    ) -> Self {
        let id = fingerprint(&fields, event_id);
        Self {
            id,
            source_id: source_id.into(),
            source_kind: fields.source_kind(),
            raw_text: raw_text.into(),
            detected_at: Utc::now(),
            fields,
        }
    }

    /// The orchestrator resource this incident is about, if any.
    pub fn resource_ref(&self) -> Option<ResourceRef> {
        match &self.fields {
            ExtractedFields::Orchestrator {
                namespace,
                pod,
                container,
                ..
            } => Some(ResourceRef::pod(namespace, pod).with_container(container)),
            ExtractedFields::Warehouse { .. } => None,
        }
    }

    /// The warehouse object this incident names, if any.
    pub fn object_name(&self) -> Option<&str> {
        match &self.fields {
            ExtractedFields::Warehouse { object_name, .. } => object_name.as_deref(),
            ExtractedFields::Orchestrator { .. } => None,
        }
    }
}

fn fingerprint(fields: &ExtractedFields, event_id: Option<&str>) -> IncidentId {
    match fields {
        ExtractedFields::Orchestrator {
            namespace,
            pod,
            container,
            ..
        } => IncidentId::new(format!("orchestrator:{namespace}/{pod}/{container}")),
        ExtractedFields::Warehouse {
            object_name: Some(obj),
            ..
        } => IncidentId::new(format!("warehouse:{}", obj.to_ascii_uppercase())),
        ExtractedFields::Warehouse {
            query_id, error_code, ..
        } => {
            let key = event_id
                .map(|e| format!("event:{e}"))
                .or_else(|| query_id.as_ref().map(|q| format!("query:{q}")))
                .or_else(|| error_code.as_ref().map(|c| format!("code:{c}")))
                .unwrap_or_else(|| format!("adhoc:{}", Uuid::new_v4()));
            IncidentId::new(format!("warehouse:{key}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Actions and analysis
// ---------------------------------------------------------------------------

/// How an orchestrator resource should be reshaped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatchSpec {
    /// Multiply CPU and memory limits by `factor`; requests become limit / 2.
    ScaleResources { factor: u32 },
}

impl Default for PatchSpec {
    fn default() -> Self {
        PatchSpec::ScaleResources { factor: 2 }
    }
}

/// One remediation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    SqlGrant {
        command: String,
    },
    OrchestratorPatch {
        resource: ResourceRef,
        patch: PatchSpec,
    },
    /// Inert: recorded and reported, never executed.
    RawCommand {
        command: String,
    },
}

impl Action {
    pub fn describe(&self) -> String {
        match self {
            Action::SqlGrant { command } => format!("sql: {command}"),
            Action::OrchestratorPatch { resource, patch } => match patch {
                PatchSpec::ScaleResources { factor } => {
                    format!("patch {resource}: scale resources x{factor}")
                }
            },
            Action::RawCommand { command } => format!("raw: {command}"),
        }
    }
}

pub const UNPARSEABLE_ROOT_CAUSE: &str = "unparseable";

/// Root cause plus an ordered list of remediation steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub root_cause: String,
    pub remediation_steps: Vec<Action>,
}

impl Analysis {
    /// The degraded analysis used whenever the analysis service cannot be
    /// understood. Its only step is inert.
    pub fn unparseable(raw_response: impl Into<String>) -> Self {
        Self {
            root_cause: UNPARSEABLE_ROOT_CAUSE.to_string(),
            remediation_steps: vec![Action::RawCommand {
                command: raw_response.into(),
            }],
        }
    }

    pub fn is_unparseable(&self) -> bool {
        self.root_cause == UNPARSEABLE_ROOT_CAUSE
    }
}

// ---------------------------------------------------------------------------
// Fix attempts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// An irreversible or side-effecting step succeeded before a later one failed.
    PartialFailure,
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::PartialFailure => "partial_failure",
            AttemptOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationResult {
    NotRun,
    Passed { check: String },
    Failed { check: String, reason: String },
}

impl VerificationResult {
    pub fn is_passed(&self) -> bool {
        matches!(self, VerificationResult::Passed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedAction {
    pub action: Action,
    pub reason: String,
}

/// The record of one pass through execute + verify for an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixAttempt {
    pub id: Uuid,
    pub incident_id: IncidentId,
    /// 1-based attempt number within the incident's feedback loop.
    pub attempt: u32,
    pub root_cause: String,
    pub actions_executed: Vec<Action>,
    pub actions_skipped: Vec<SkippedAction>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Resources deleted by this attempt that were never recreated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destroyed: Vec<ResourceRef>,
    pub verification_result: VerificationResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FixAttempt {
    pub fn begin(incident_id: IncidentId, attempt: u32, root_cause: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            incident_id,
            attempt,
            root_cause: root_cause.into(),
            actions_executed: Vec::new(),
            actions_skipped: Vec::new(),
            outcome: AttemptOutcome::Failed,
            failure: None,
            destroyed: Vec::new(),
            verification_result: VerificationResult::NotRun,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.outcome == AttemptOutcome::Success && self.verification_result.is_passed()
    }

    /// Plain-language description of why this attempt did not fix the
    /// incident, suitable as feedback for the next classification.
    pub fn failure_summary(&self) -> String {
        let mut lines = vec![format!(
            "Attempt {} (root cause: {}) ended with outcome {}.",
            self.attempt, self.root_cause, self.outcome
        )];
        if let Some(f) = &self.failure {
            lines.push(format!("Failure: {f}"));
        }
        for skipped in &self.actions_skipped {
            lines.push(format!(
                "Skipped step '{}': {}",
                skipped.action.describe(),
                skipped.reason
            ));
        }
        for r in &self.destroyed {
            lines.push(format!("Resource {r} was deleted and no longer exists."));
        }
        if let VerificationResult::Failed { check, reason } = &self.verification_result {
            lines.push(format!("Check '{check}': {reason}"));
        }
        lines.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn oom_fields() -> ExtractedFields {
        ExtractedFields::Orchestrator {
            namespace: "ns1".into(),
            pod: "p1".into(),
            container: "c1".into(),
            reason: "OOMKilled".into(),
        }
    }

    #[test]
    fn orchestrator_fingerprint_is_stable() {
        let a = Incident::new("cluster", "raw a", oom_fields(), Some("e1"));
        let b = Incident::new("cluster", "raw b", oom_fields(), Some("e2"));
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.as_str(), "orchestrator:ns1/p1/c1");
        assert_eq!(a.source_kind, SourceKind::Orchestrator);
    }

    #[test]
    fn warehouse_fingerprint_prefers_object_name() {
        let fields = ExtractedFields::Warehouse {
            object_name: Some("db.sales.orders".into()),
            error_code: Some("002003".into()),
            error_message: None,
            query_id: None,
        };
        let inc = Incident::new("query-history", "raw", fields, Some("e1"));
        assert_eq!(inc.id.as_str(), "warehouse:DB.SALES.ORDERS");
        assert_eq!(inc.object_name(), Some("db.sales.orders"));
        assert!(inc.resource_ref().is_none());
    }

    #[test]
    fn warehouse_without_object_uses_event_id() {
        let fields = ExtractedFields::Warehouse {
            object_name: None,
            error_code: Some("390100".into()),
            error_message: None,
            query_id: None,
        };
        let inc = Incident::new("login-history", "raw", fields, Some("evt-9"));
        assert_eq!(inc.id.as_str(), "warehouse:event:evt-9");
    }

    #[test]
    fn resource_ref_carries_container() {
        let inc = Incident::new("cluster", "raw", oom_fields(), None);
        let r = inc.resource_ref().unwrap();
        assert_eq!(r.kind, "pod");
        assert_eq!(r.container.as_deref(), Some("c1"));
        assert_eq!(r.to_string(), "pod ns1/p1 (container c1)");
    }

    #[test]
    fn action_json_is_tagged() {
        let action = Action::SqlGrant {
            command: "GRANT SELECT ON TABLE t TO ROLE r;".into(),
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"sql_grant\""));
        let parsed: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, action);
    }

    #[test]
    fn unparseable_analysis_is_inert() {
        let a = Analysis::unparseable("garbage");
        assert!(a.is_unparseable());
        assert_eq!(
            a.remediation_steps,
            vec![Action::RawCommand {
                command: "garbage".into()
            }]
        );
    }

    #[test]
    fn failure_summary_mentions_destroyed_resources() {
        let mut attempt = FixAttempt::begin(IncidentId::new("x"), 2, "oom");
        attempt.outcome = AttemptOutcome::PartialFailure;
        attempt.failure = Some("apply failed".into());
        attempt.destroyed.push(ResourceRef::pod("ns1", "p1"));
        let summary = attempt.failure_summary();
        assert!(summary.contains("Attempt 2"));
        assert!(summary.contains("partial_failure"));
        assert!(summary.contains("apply failed"));
        assert!(summary.contains("pod ns1/p1 was deleted"));
    }

    #[test]
    fn source_kind_parses() {
        assert_eq!(
            "warehouse".parse::<SourceKind>().unwrap(),
            SourceKind::Warehouse
        );
        assert!("database".parse::<SourceKind>().is_err());
    }
}
