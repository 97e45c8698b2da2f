//! The handoff record: the latest completed analysis, mirrored to a JSON
//! file for operators. Last write wins.

use crate::error::Result;
use crate::io::atomic_write;
use crate::types::{Action, Analysis, Incident, IncidentId, ResourceRef, SourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    /// Raw error text the analysis was made from.
    pub error: String,
    pub root_cause: String,
    pub remediation_steps: Vec<Action>,
    /// Id of the configured source that reported the error.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_ref: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_kind: Option<SourceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<IncidentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_at: Option<DateTime<Utc>>,
}

impl HandoffRecord {
    pub fn new(incident: &Incident, analysis: &Analysis) -> Self {
        Self {
            error: incident.raw_text.clone(),
            root_cause: analysis.root_cause.clone(),
            remediation_steps: analysis.remediation_steps.clone(),
            source: incident.source_id.clone(),
            manifest_ref: incident.resource_ref(),
            source_kind: Some(incident.source_kind),
            incident_id: Some(incident.id.clone()),
            written_at: Some(Utc::now()),
        }
    }

    pub fn analysis(&self) -> Analysis {
        Analysis {
            root_cause: self.root_cause.clone(),
            remediation_steps: self.remediation_steps.clone(),
        }
    }
}

/// Replace the record at `path`.
pub fn write(path: &Path, record: &HandoffRecord) -> Result<()> {
    let data = serde_json::to_vec_pretty(record)?;
    atomic_write(path, &data)
}

/// Read the record at `path`. A missing, empty or truncated file reads as
/// `None`; any other malformed content is an error.
pub fn read(path: &Path) -> Result<Option<HandoffRecord>> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if data.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(&data) {
        Ok(record) => Ok(Some(record)),
        Err(e) if e.is_eof() => Ok(None),
        Err(e) => Err(e.into()),
    }
}
