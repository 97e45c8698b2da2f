use anyhow::Context;
use autoheal_core::{config::Config, io, paths};
use std::path::Path;

pub fn run(root: &Path, force: bool) -> anyhow::Result<()> {
    println!("Initializing autoheal in: {}", root.display());

    for dir in [paths::AUTOHEAL_DIR, paths::CURSORS_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let config_path = paths::config_path(root);
    let yaml = Config::example().to_yaml()?;
    let written = if force {
        io::atomic_write(&config_path, yaml.as_bytes()).map(|()| true)
    } else {
        io::write_if_missing(&config_path, yaml.as_bytes())
    }
    .context("failed to write config.yaml")?;

    if written {
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    println!("\nNext: edit {} and run `autoheal config validate`", paths::CONFIG_FILE);
    Ok(())
}
