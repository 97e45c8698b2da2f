use crate::output::print_json;
use autoheal_core::gate::{check_sql_grant, Verdict};

/// Report whether `command` would pass the grant allowlist. Exits non-zero
/// when it would be rejected.
pub fn run(command: &str, json: bool) -> anyhow::Result<()> {
    let verdict = check_sql_grant(command);
    if json {
        let value = match &verdict {
            Verdict::Allowed => serde_json::json!({ "allowed": true }),
            Verdict::Rejected(reason) => {
                serde_json::json!({ "allowed": false, "reason": reason })
            }
        };
        print_json(&value)?;
    }
    match verdict {
        Verdict::Allowed => {
            if !json {
                println!("allowed");
            }
            Ok(())
        }
        Verdict::Rejected(reason) => anyhow::bail!("rejected: {reason}"),
    }
}
