//! Safety gate for warehouse statements.
//!
//! The only statement the executor may run on an analysis service's say-so is a
//! single table-scoped grant to a role:
//!
//! ```text
//! GRANT SELECT, INSERT ON TABLE DB.SCHEMA.ORDERS TO ROLE ANALYST;
//! ```
//!
//! Everything else is rejected before any warehouse call is made.

use crate::error::{HealError, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Table privileges a remediation may hand out.
pub const ALLOWED_PRIVILEGES: &[&str] = &[
    "SELECT",
    "INSERT",
    "UPDATE",
    "DELETE",
    "TRUNCATE",
    "REFERENCES",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Rejected(String),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allowed => f.write_str("allowed"),
            Verdict::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

const IDENT: &str = r#"[A-Za-z0-9_$."]+"#;

static GRANT_RE: OnceLock<Regex> = OnceLock::new();
static IDENT_RE: OnceLock<Regex> = OnceLock::new();

fn grant_re() -> &'static Regex {
    GRANT_RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)^\s*GRANT\s+([A-Z_]+(?:\s*,\s*[A-Z_]+)*)\s+ON\s+TABLE\s+({IDENT})\s+TO\s+ROLE\s+({IDENT})\s*;\s*$"
        ))
        .unwrap()
    })
}

fn ident_re() -> &'static Regex {
    IDENT_RE.get_or_init(|| Regex::new(&format!("^{IDENT}$")).unwrap())
}

/// Check a candidate `SqlGrant` command against the allowlist.
pub fn check_sql_grant(command: &str) -> Verdict {
    if command.contains("--") || command.contains("/*") {
        return Verdict::Rejected("contains a SQL comment".to_string());
    }
    let body = command.trim_end();
    let body = body.strip_suffix(';').unwrap_or(body);
    if body.contains(';') {
        return Verdict::Rejected("contains more than one statement".to_string());
    }

    let Some(caps) = grant_re().captures(command) else {
        return Verdict::Rejected(
            "not a single GRANT ... ON TABLE ... TO ROLE ...; statement".to_string(),
        );
    };

    for privilege in caps[1].split(',') {
        let privilege = privilege.trim().to_ascii_uppercase();
        if !ALLOWED_PRIVILEGES.contains(&privilege.as_str()) {
            return Verdict::Rejected(format!("privilege '{privilege}' is not grantable"));
        }
    }

    for ident in [&caps[2], &caps[3]] {
        if let Err(e) = validate_identifier(ident) {
            return Verdict::Rejected(e.to_string());
        }
    }

    Verdict::Allowed
}

/// A possibly qualified object name such as `DB.SCHEMA.TABLE`. Parts may be
/// double-quoted but may not contain whitespace.
pub fn validate_identifier(ident: &str) -> Result<&str> {
    let invalid = || HealError::InvalidIdentifier(ident.to_string());
    if !ident_re().is_match(ident) || ident.matches('"').count() % 2 != 0 {
        return Err(invalid());
    }
    if ident.split('.').any(|part| part.trim_matches('"').is_empty()) {
        return Err(invalid());
    }
    Ok(ident)
}

/// Targeted reachability check for a named warehouse object.
pub fn object_probe_sql(object: &str) -> Result<String> {
    let ident = validate_identifier(object)?;
    Ok(format!("SELECT 1 FROM {ident} LIMIT 1;"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_table_grants() {
        for cmd in [
            "GRANT SELECT ON TABLE SALES.PUBLIC.ORDERS TO ROLE ANALYST;",
            "grant select, insert on table orders to role etl_role;",
            "  GRANT UPDATE ON TABLE \"DB\".\"S\".\"T\" TO ROLE R1 ;  ",
            "GRANT\nSELECT\nON TABLE t\nTO ROLE r;",
        ] {
            assert_eq!(check_sql_grant(cmd), Verdict::Allowed, "{cmd}");
        }
    }

    #[test]
    fn rejects_everything_else() {
        for cmd in [
            "DROP TABLE orders;",
            "GRANT SELECT ON TABLE orders TO ROLE analyst",
            "GRANT SELECT ON SCHEMA sales TO ROLE analyst;",
            "GRANT ROLE sysadmin TO USER bob;",
            "GRANT SELECT ON TABLE orders TO USER bob;",
            "GRANT SELECT ON TABLE orders TO ROLE analyst; DROP TABLE orders;",
            "GRANT SELECT ON TABLE orders TO ROLE analyst; -- ok",
            "GRANT SELECT ON TABLE orders /* x */ TO ROLE analyst;",
            "GRANT OWNERSHIP ON TABLE orders TO ROLE analyst;",
            "GRANT ALL ON TABLE orders TO ROLE analyst;",
            "REVOKE SELECT ON TABLE orders FROM ROLE analyst;",
            "",
        ] {
            assert!(!check_sql_grant(cmd).is_allowed(), "should reject: {cmd}");
        }
    }

    #[test]
    fn rejection_reason_names_privilege() {
        match check_sql_grant("GRANT OWNERSHIP ON TABLE t TO ROLE r;") {
            Verdict::Rejected(reason) => assert!(reason.contains("OWNERSHIP")),
            Verdict::Allowed => panic!("ownership must not be grantable"),
        }
    }

    #[test]
    fn identifiers() {
        assert!(validate_identifier("DB.SCHEMA.T").is_ok());
        assert!(validate_identifier("\"DB\".T").is_ok());
        assert!(validate_identifier("T$1").is_ok());
        assert!(validate_identifier("DB..T").is_err());
        assert!(validate_identifier("\"DB.T").is_err());
        assert!(validate_identifier("t; drop").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn probe_sql_is_validated() {
        assert_eq!(
            object_probe_sql("SALES.PUBLIC.ORDERS").unwrap(),
            "SELECT 1 FROM SALES.PUBLIC.ORDERS LIMIT 1;"
        );
        assert!(object_probe_sql("orders; DROP TABLE x").is_err());
    }
}
