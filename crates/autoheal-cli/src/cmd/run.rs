use crate::output::print_json;
use anyhow::Context;
use autoheal_core::config::{self, Config};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;

    let warnings = config.validate();
    for w in &warnings {
        tracing::warn!(level = ?w.level, "{}", w.message);
    }
    if config::has_errors(&warnings) {
        anyhow::bail!("config has errors; run `autoheal config validate` for details");
    }

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(autoheal_server::run(root.to_path_buf(), config))?;

    let d = &summary.dispatch;
    if json {
        print_json(&serde_json::json!({
            "sources": summary.sources,
            "fixed": d.fixed,
            "exhausted": d.exhausted,
            "escalated": d.escalated,
            "abandoned": d.abandoned,
        }))?;
    } else {
        println!(
            "Stopped. {} source(s); fixed {}, exhausted {}, escalated {}, abandoned {}.",
            summary.sources, d.fixed, d.exhausted, d.escalated, d.abandoned
        );
    }
    Ok(())
}
