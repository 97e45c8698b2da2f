use autoheal_core::types::{Incident, SourceKind};

use crate::provider::CompletionRequest;

const SYSTEM: &str = "You are an operations assistant that diagnoses production errors \
and proposes the smallest safe remediation. Reply with a single JSON object and nothing else.";

const WAREHOUSE_INSTRUCTIONS: &str = "Analyze the root cause of this data warehouse error \
(focus on permission-related issues) and provide actionable remediation steps.\n\
Return a JSON object with:\n\
- \"root_cause\": a brief description of the issue\n\
- \"remediation_steps\": a list of SQL statements only. Each must be a single \
GRANT <privilege> ON TABLE <table> TO ROLE <role>; statement. Do not include \
explanations or any other text.";

const ORCHESTRATOR_INSTRUCTIONS: &str = "Analyze the root cause of this container \
orchestrator error and provide remediation steps.\n\
Return a JSON object with:\n\
- \"root_cause\": a brief description of the issue\n\
- \"remediation_steps\": a list of steps. If the container ran out of memory or CPU, \
use the step {\"action\": \"scale_resources\"} to double its resource limits. \
Any other suggestion must be a plain string; it will be recorded for an operator \
and not executed.";

/// Build the classification request for `incident`. `feedback` describes
/// earlier remediation attempts that did not fix it.
pub fn build_request(incident: &Incident, feedback: Option<&str>) -> CompletionRequest {
    let instructions = match incident.source_kind {
        SourceKind::Warehouse => WAREHOUSE_INSTRUCTIONS,
        SourceKind::Orchestrator => ORCHESTRATOR_INSTRUCTIONS,
    };

    let mut prompt = format!("{instructions}\n\nError:\n{}\n", incident.raw_text.trim());
    if let Some(resource) = incident.resource_ref() {
        prompt.push_str(&format!("\nAffected resource: {resource}\n"));
    }
    if let Some(object) = incident.object_name() {
        prompt.push_str(&format!("\nAffected object: {object}\n"));
    }
    if let Some(feedback) = feedback.map(str::trim).filter(|f| !f.is_empty()) {
        prompt.push_str(&format!(
            "\nPrevious remediation attempts did not fix the error:\n{feedback}\n\
             Propose a different remediation that accounts for these failures.\n"
        ));
    }

    CompletionRequest {
        system: SYSTEM.to_string(),
        prompt,
    }
}
