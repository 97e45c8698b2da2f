//! Turn raw error payloads into [`ExtractedFields`].
//!
//! Two strategies run in order and the first that yields the minimum identity
//! wins:
//!
//! 1. regex over human-readable text (`ERROR_CODE: ...`, `pod=... namespace=...`)
//! 2. field lookup in a JSON audit payload embedded in the record
//!
//! Anything that neither strategy can identify is [`Extraction::Unextractable`]
//! and must not be classified.

use crate::error::Result;
use crate::types::{ExtractedFields, SourceKind};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

pub const OOM_REASON: &str = "OOMKilled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Extracted(ExtractedFields),
    Unextractable(String),
}

impl Extraction {
    pub fn fields(self) -> Option<ExtractedFields> {
        match self {
            Extraction::Extracted(f) => Some(f),
            Extraction::Unextractable(_) => None,
        }
    }
}

pub fn extract(kind: SourceKind, raw: &str) -> Extraction {
    let from_text = match kind {
        SourceKind::Warehouse => warehouse_from_text(raw),
        SourceKind::Orchestrator => orchestrator_from_text(raw),
    };
    if let Some(fields) = from_text {
        return Extraction::Extracted(fields);
    }

    let Some(json) = embedded_json(raw) else {
        return Extraction::Unextractable(match kind {
            SourceKind::Warehouse => "no object name or error code in text".to_string(),
            SourceKind::Orchestrator => "no pod, namespace and container in text".to_string(),
        });
    };

    let from_json = match kind {
        SourceKind::Warehouse => warehouse_from_json(&json),
        SourceKind::Orchestrator => orchestrator_from_json(&json),
    };
    match from_json {
        Some(fields) => Extraction::Extracted(fields),
        None => Extraction::Unextractable(match kind {
            SourceKind::Warehouse => "JSON payload has no object name or error code".to_string(),
            SourceKind::Orchestrator => {
                "JSON payload has no OOM-terminated container with namespace and name".to_string()
            }
        }),
    }
}

// ---------------------------------------------------------------------------
// Warehouse
// ---------------------------------------------------------------------------

static ERROR_CODE_RE: OnceLock<Regex> = OnceLock::new();
static QUERY_ID_RE: OnceLock<Regex> = OnceLock::new();
static ERROR_MESSAGE_RE: OnceLock<Regex> = OnceLock::new();
static OBJECT_RE: OnceLock<Regex> = OnceLock::new();

fn error_code_re() -> &'static Regex {
    ERROR_CODE_RE.get_or_init(|| Regex::new(r"(?m)^\s*ERROR_CODE:\s*(\S+)").unwrap())
}

fn query_id_re() -> &'static Regex {
    QUERY_ID_RE.get_or_init(|| Regex::new(r"(?m)^\s*QUERY_ID:\s*(\S+)").unwrap())
}

fn error_message_re() -> &'static Regex {
    ERROR_MESSAGE_RE.get_or_init(|| Regex::new(r"(?m)^\s*ERROR_MESSAGE:\s*(.+?)\s*$").unwrap())
}

fn object_re() -> &'static Regex {
    OBJECT_RE.get_or_init(|| {
        Regex::new(
            r#"(?i)(?:(?:object|table|view)\s+'([^']+)'\s+does not exist|insufficient privileges to operate on (?:table|view)\s+'([^']+)')"#,
        )
        .unwrap()
    })
}

/// `None`, `null` and empty strings mean "no value" in warehouse telemetry.
fn present(value: &str) -> Option<String> {
    let v = value.trim().trim_matches('"');
    if v.is_empty() || v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(v.to_string())
    }
}

fn object_name_in(text: &str) -> Option<String> {
    let caps = object_re().captures(text)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

fn warehouse_fields(
    object_name: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    query_id: Option<String>,
) -> Option<ExtractedFields> {
    if object_name.is_none() && error_code.is_none() {
        return None;
    }
    Some(ExtractedFields::Warehouse {
        object_name,
        error_code,
        error_message,
        query_id,
    })
}

/// Needs at least one labelled line; bare prose is left to the JSON strategy.
fn warehouse_from_text(raw: &str) -> Option<ExtractedFields> {
    let labelled = [error_code_re(), error_message_re(), query_id_re()]
        .iter()
        .any(|re| re.is_match(raw));
    if !labelled {
        return None;
    }
    let capture = |re: &Regex| re.captures(raw).and_then(|c| present(&c[1]));
    let error_message = capture(error_message_re());
    let object_name = error_message
        .as_deref()
        .and_then(object_name_in)
        .or_else(|| object_name_in(raw));
    warehouse_fields(
        object_name,
        capture(error_code_re()),
        error_message,
        capture(query_id_re()),
    )
}

fn warehouse_from_json(json: &Value) -> Option<ExtractedFields> {
    let field = |keys: &[&str]| {
        keys.iter().find_map(|k| match json.get(*k)? {
            Value::String(s) => present(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };
    let error_message = field(&["ERROR_MESSAGE", "error_message", "errorMessage"]);
    let object_name = field(&["OBJECT_NAME", "object_name", "objectName"])
        .or_else(|| error_message.as_deref().and_then(object_name_in));
    warehouse_fields(
        object_name,
        field(&["ERROR_CODE", "error_code", "errorCode"]),
        error_message,
        field(&["QUERY_ID", "query_id", "queryId"]),
    )
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

static NAMESPACE_RE: OnceLock<Regex> = OnceLock::new();
static POD_RE: OnceLock<Regex> = OnceLock::new();
static CONTAINER_RE: OnceLock<Regex> = OnceLock::new();
static REASON_RE: OnceLock<Regex> = OnceLock::new();

fn key_value_re(key: &str) -> Regex {
    Regex::new(&format!(
        r#"(?i)\b{key}\b["']?\s*[:=]\s*["']?([a-z0-9][a-z0-9.\-]*)"#
    ))
    .unwrap()
}

fn namespace_re() -> &'static Regex {
    NAMESPACE_RE.get_or_init(|| key_value_re("namespace"))
}

fn pod_re() -> &'static Regex {
    POD_RE.get_or_init(|| key_value_re("pod"))
}

fn container_re() -> &'static Regex {
    CONTAINER_RE.get_or_init(|| key_value_re("container"))
}

fn reason_re() -> &'static Regex {
    REASON_RE.get_or_init(|| Regex::new(r"\b(OOMKilled|CrashLoopBackOff|Error)\b").unwrap())
}

fn orchestrator_from_text(raw: &str) -> Option<ExtractedFields> {
    let capture = |re: &Regex| re.captures(raw).map(|c| c[1].to_string());
    let namespace = capture(namespace_re())?;
    let pod = capture(pod_re())?;
    let container = capture(container_re())?;
    let reason = reason_re()
        .captures(raw)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    Some(ExtractedFields::Orchestrator {
        namespace,
        pod,
        container,
        reason,
    })
}

fn str_at<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(v, |cur, key| cur.get(*key))?
        .as_str()
        .filter(|s| !s.is_empty())
}

fn orchestrator_from_json(json: &Value) -> Option<ExtractedFields> {
    // Audit events wrap the object in `requestObject`/`responseObject`.
    let object = ["responseObject", "requestObject"]
        .iter()
        .find_map(|k| json.get(*k).filter(|o| o.get("status").is_some()))
        .unwrap_or(json);

    let namespace = str_at(json, &["objectRef", "namespace"])
        .or_else(|| str_at(object, &["metadata", "namespace"]))?;
    let pod = str_at(json, &["objectRef", "name"]).or_else(|| str_at(object, &["metadata", "name"]))?;

    let statuses = object
        .get("status")
        .and_then(|s| s.get("containerStatuses"))
        .and_then(Value::as_array)?;
    let container = statuses.iter().find_map(|status| {
        let oom = ["state", "lastState"]
            .iter()
            .any(|k| str_at(status, &[*k, "terminated", "reason"]) == Some(OOM_REASON));
        if oom {
            str_at(status, &["name"])
        } else {
            None
        }
    })?;

    Some(ExtractedFields::Orchestrator {
        namespace: namespace.to_string(),
        pod: pod.to_string(),
        container: container.to_string(),
        reason: OOM_REASON.to_string(),
    })
}

/// The first JSON object in `raw`, which may be prefixed by a header line
/// such as `Error in <group>:`.
fn embedded_json(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
    match stream.next()? {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Error predicate
// ---------------------------------------------------------------------------

pub const DEFAULT_ORCHESTRATOR_PATTERN: &str = r"OOMKilled|CrashLoopBackOff|Error";

/// Decides whether a telemetry message describes a failure worth extracting.
#[derive(Debug, Clone)]
pub enum ErrorFilter {
    /// Query-history style status lines: not a success and not an empty
    /// `ERROR_CODE: None` / `ERROR_MESSAGE: None` pair.
    WarehouseStatus,
    Pattern(Regex),
}

impl ErrorFilter {
    pub fn for_source(kind: SourceKind, pattern: Option<&str>) -> Result<Self> {
        Ok(match (pattern, kind) {
            (Some(p), _) => ErrorFilter::Pattern(Regex::new(p)?),
            (None, SourceKind::Warehouse) => ErrorFilter::WarehouseStatus,
            (None, SourceKind::Orchestrator) => {
                ErrorFilter::Pattern(Regex::new(DEFAULT_ORCHESTRATOR_PATTERN)?)
            }
        })
    }

    pub fn is_error(&self, message: &str) -> bool {
        match self {
            ErrorFilter::WarehouseStatus => {
                !message.contains("EXECUTION_STATUS: SUCCESS")
                    && (!message.contains("ERROR_CODE: None")
                        || !message.contains("ERROR_MESSAGE: None"))
            }
            ErrorFilter::Pattern(re) => re.is_match(message),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
