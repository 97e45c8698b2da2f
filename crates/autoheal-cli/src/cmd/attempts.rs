use crate::output::{print_json, print_table};
use anyhow::Context;
use autoheal_core::ledger::AttemptDb;
use autoheal_core::paths;
use autoheal_core::types::{FixAttempt, IncidentId, VerificationResult};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum AttemptsSubcommand {
    /// List recorded fix attempts, newest first
    List {
        /// Only attempts for this incident id
        #[arg(long)]
        incident: Option<String>,
        /// Maximum number of attempts to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

pub fn run(root: &Path, subcmd: AttemptsSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        AttemptsSubcommand::List { incident, limit } => list(root, incident, limit, json),
    }
}

fn list(root: &Path, incident: Option<String>, limit: usize, json: bool) -> anyhow::Result<()> {
    let path = paths::ledger_path(root);
    let attempts = if path.exists() {
        let db = AttemptDb::open(&path).context("failed to open attempt ledger")?;
        match incident {
            Some(id) => {
                let mut attempts = db.for_incident(&IncidentId::new(id))?;
                attempts.reverse();
                attempts.truncate(limit);
                attempts
            }
            None => db.recent(limit)?,
        }
    } else {
        Vec::new()
    };

    if json {
        print_json(&attempts)?;
        return Ok(());
    }
    if attempts.is_empty() {
        println!("No fix attempts recorded.");
        return Ok(());
    }

    let rows = attempts.iter().map(row).collect();
    print_table(
        &["FINISHED", "INCIDENT", "#", "OUTCOME", "VERIFIED", "ROOT CAUSE"],
        rows,
    );
    Ok(())
}

fn row(a: &FixAttempt) -> Vec<String> {
    let verified = match &a.verification_result {
        VerificationResult::NotRun => "-".to_string(),
        VerificationResult::Passed { .. } => "passed".to_string(),
        VerificationResult::Failed { .. } => "failed".to_string(),
    };
    vec![
        a.finished_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        a.incident_id.to_string(),
        a.attempt.to_string(),
        a.outcome.to_string(),
        verified,
        a.root_cause.clone(),
    ]
}
