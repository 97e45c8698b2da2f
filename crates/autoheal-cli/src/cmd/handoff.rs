use crate::output::{print_json, print_table};
use anyhow::Context;
use autoheal_core::config::Config;
use autoheal_core::extract::{extract, Extraction};
use autoheal_core::handoff::{self, HandoffRecord};
use autoheal_core::ledger::AttemptDb;
use autoheal_core::paths;
use autoheal_core::types::{AttemptOutcome, ExtractedFields, Incident, SourceKind};
use autoheal_server::backend::{CliWarehouse, Kubectl};
use autoheal_server::executor::Executor;
use autoheal_server::verifier::Verifier;
use chrono::Utc;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Subcommand)]
pub enum HandoffSubcommand {
    /// Show the latest handoff record
    Show,

    /// Execute and verify the latest handoff record once
    Apply,
}

pub fn run(root: &Path, subcmd: HandoffSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let path = handoff_path(root, &config);
    let record = handoff::read(&path)?;

    match subcmd {
        HandoffSubcommand::Show => show(&path, record, json),
        HandoffSubcommand::Apply => {
            let record = record
                .with_context(|| format!("no handoff record at {}", path.display()))?;
            apply(root, &config, &record, json)
        }
    }
}

fn handoff_path(root: &Path, config: &Config) -> PathBuf {
    match &config.handoff_file {
        Some(p) => paths::resolve(root, p),
        None => paths::default_handoff_path(root),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(path: &Path, record: Option<HandoffRecord>, json: bool) -> anyhow::Result<()> {
    let Some(record) = record else {
        if json {
            print_json(&serde_json::Value::Null)?;
        } else {
            println!("No handoff record at {}.", path.display());
        }
        return Ok(());
    };
    if json {
        return print_json(&record);
    }

    println!("source:     {}", record.source);
    if let Some(id) = &record.incident_id {
        println!("incident:   {id}");
    }
    if let Some(r) = &record.manifest_ref {
        println!("resource:   {r}");
    }
    if let Some(at) = record.written_at {
        println!("written:    {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("root cause: {}", record.root_cause);
    println!();
    let rows = record
        .remediation_steps
        .iter()
        .enumerate()
        .map(|(i, a)| vec![(i + 1).to_string(), a.describe()])
        .collect();
    print_table(&["#", "STEP"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

fn apply(root: &Path, config: &Config, record: &HandoffRecord, json: bool) -> anyhow::Result<()> {
    let incident = rebuild_incident(record)?;
    let analysis = record.analysis();

    let ledger = match AttemptDb::open(&paths::ledger_path(root)) {
        Ok(db) => Some(db),
        Err(e) => {
            tracing::warn!(error = %e, "attempt ledger unavailable, attempt will not be recorded");
            None
        }
    };
    let previous = match &ledger {
        Some(db) => db.for_incident(&incident.id)?.len() as u32,
        None => 0,
    };

    let warehouse = Arc::new(CliWarehouse::new(&config.warehouse));
    let orchestrator = Arc::new(Kubectl::new(&config.orchestrator));
    let executor = Executor::new(warehouse.clone(), orchestrator.clone(), config.timeouts.clone());
    let verifier = Verifier::new(
        warehouse,
        orchestrator,
        config.warehouse.liveness_sql.clone(),
        config.timeouts.clone(),
    );

    let rt = tokio::runtime::Runtime::new()?;
    let attempt = rt.block_on(async {
        let mut attempt = executor.execute(&incident, &analysis, previous + 1).await;
        if attempt.outcome == AttemptOutcome::Success {
            attempt.verification_result = verifier.verify(&incident, &attempt).await;
        }
        attempt.finished_at = Utc::now();
        attempt
    });

    if let Some(db) = &ledger {
        db.record(&attempt).context("failed to record attempt")?;
    }

    if json {
        print_json(&attempt)?;
    } else {
        println!("incident: {}", incident.id);
        println!("attempt:  {}", attempt.attempt);
        println!("outcome:  {}", attempt.outcome);
        for a in &attempt.actions_executed {
            println!("  done:    {}", a.describe());
        }
        for s in &attempt.actions_skipped {
            println!("  skipped: {} ({})", s.action.describe(), s.reason);
        }
    }

    if !attempt.is_fixed() {
        anyhow::bail!("not fixed:\n{}", attempt.failure_summary());
    }
    Ok(())
}

/// Recover the incident a handoff record was written for. The raw error is
/// re-extracted; an orchestrator record that no longer extracts falls back to
/// its manifest reference.
fn rebuild_incident(record: &HandoffRecord) -> anyhow::Result<Incident> {
    let kind = record.source_kind.unwrap_or(if record.manifest_ref.is_some() {
        SourceKind::Orchestrator
    } else {
        SourceKind::Warehouse
    });

    let fields = match extract(kind, &record.error) {
        Extraction::Extracted(fields) => fields,
        Extraction::Unextractable(reason) => match (kind, &record.manifest_ref) {
            (SourceKind::Orchestrator, Some(r)) => ExtractedFields::Orchestrator {
                namespace: r.namespace.clone(),
                pod: r.name.clone(),
                container: r
                    .container
                    .clone()
                    .with_context(|| format!("{r} names no container"))?,
                reason: "Unknown".to_string(),
            },
            (SourceKind::Orchestrator, None) => {
                anyhow::bail!("cannot recover the incident: {reason}")
            }
            (SourceKind::Warehouse, _) => ExtractedFields::Warehouse {
                object_name: None,
                error_code: None,
                error_message: None,
                query_id: None,
            },
        },
    };

    let mut incident = Incident::new(&record.source, record.error.clone(), fields, None);
    // Keep the id the pipeline used so ledger history lines up.
    if let Some(id) = &record.incident_id {
        incident.id = id.clone();
    }
    Ok(incident)
}
