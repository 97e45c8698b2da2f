use crate::output::print_json;
use anyhow::Context;
use autoheal_core::extract::{extract, Extraction};
use autoheal_core::types::{ExtractedFields, Incident, SourceKind};
use std::io::Read;
use std::path::Path;

/// Run the extractor over one raw record and show what the pipeline would
/// see. Nothing is remediated.
pub fn run(kind: &str, file: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let kind: SourceKind = kind.parse()?;
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };

    let fields = match extract(kind, &raw) {
        Extraction::Extracted(fields) => fields,
        Extraction::Unextractable(reason) => anyhow::bail!("unextractable: {reason}"),
    };
    let incident = Incident::new("dry-run", raw, fields, None);

    if json {
        print_json(&serde_json::json!({
            "incident_id": incident.id,
            "fields": incident.fields,
            "resource": incident.resource_ref().map(|r| r.to_string()),
        }))?;
        return Ok(());
    }

    println!("incident: {}", incident.id);
    match &incident.fields {
        ExtractedFields::Orchestrator {
            namespace,
            pod,
            container,
            reason,
        } => {
            println!("namespace: {namespace}");
            println!("pod:       {pod}");
            println!("container: {container}");
            println!("reason:    {reason}");
        }
        ExtractedFields::Warehouse {
            object_name,
            error_code,
            error_message,
            query_id,
        } => {
            let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
            println!("object:    {}", show(object_name));
            println!("code:      {}", show(error_code));
            println!("message:   {}", show(error_message));
            println!("query id:  {}", show(query_id));
        }
    }
    Ok(())
}
