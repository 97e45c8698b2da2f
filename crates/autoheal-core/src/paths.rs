use crate::error::{HealError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const AUTOHEAL_DIR: &str = ".autoheal";
pub const CURSORS_DIR: &str = ".autoheal/cursors";

pub const CONFIG_FILE: &str = ".autoheal/config.yaml";
pub const LEDGER_FILE: &str = ".autoheal/attempts.redb";
pub const HANDOFF_FILE: &str = ".autoheal/fix_queue.json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn autoheal_dir(root: &Path) -> PathBuf {
    root.join(AUTOHEAL_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn cursor_path(root: &Path, source_id: &str) -> PathBuf {
    root.join(CURSORS_DIR).join(format!("{source_id}.json"))
}

pub fn ledger_path(root: &Path) -> PathBuf {
    root.join(LEDGER_FILE)
}

pub fn default_handoff_path(root: &Path) -> PathBuf {
    root.join(HANDOFF_FILE)
}

/// Resolve a path from the config file: absolute paths are kept, relative
/// ones are taken from the project root.
pub fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

// ---------------------------------------------------------------------------
// Source id validation
// ---------------------------------------------------------------------------

static SLUG_RE: OnceLock<Regex> = OnceLock::new();

fn slug_re() -> &'static Regex {
    SLUG_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Source ids double as file names under `.autoheal/cursors/`.
pub fn validate_source_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 || !slug_re().is_match(id) {
        return Err(HealError::InvalidSlug(id.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
