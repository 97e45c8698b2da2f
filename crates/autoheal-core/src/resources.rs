//! Unit-aware resource arithmetic and manifest rewriting for the
//! delete-then-recreate resource patch.
//!
//! CPU quantities are held in millicores, memory quantities as an integer
//! amount of their own suffix. Doubling keeps the suffix (`512Mi` becomes
//! `1024Mi`, never `1Gi`); halving steps down to the next finer unit when the
//! amount is odd (`3Gi / 2` is `1536Mi`).

use crate::error::{HealError, Result};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// CPU
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cpu {
    millis: u64,
    /// Written with the `m` suffix.
    milli: bool,
}

impl Cpu {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || HealError::InvalidQuantity(s.to_string());
        let s = s.trim();
        if let Some(m) = s.strip_suffix('m') {
            let millis = m.parse::<u64>().map_err(|_| invalid())?;
            return Ok(Self { millis, milli: true });
        }
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
        if (whole.is_empty() && frac.is_empty()) || frac.len() > 3 {
            return Err(invalid());
        }
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac_millis: u64 = if frac.is_empty() {
            0
        } else {
            if !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            format!("{frac:0<3}").parse().map_err(|_| invalid())?
        };
        let millis = whole
            .checked_mul(1000)
            .and_then(|w| w.checked_add(frac_millis))
            .ok_or_else(invalid)?;
        Ok(Self {
            millis,
            milli: false,
        })
    }

    pub fn millis(self) -> u64 {
        self.millis
    }

    pub fn scale(self, factor: u32) -> Result<Self> {
        let millis = self
            .millis
            .checked_mul(u64::from(factor))
            .ok_or_else(|| HealError::InvalidQuantity(self.to_string()))?;
        Ok(Self { millis, ..self })
    }

    pub fn half(self) -> Self {
        Self {
            millis: self.millis.div_ceil(2),
            ..self
        }
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.milli && self.millis % 1000 == 0 {
            write!(f, "{}", self.millis / 1000)
        } else {
            write!(f, "{}m", self.millis)
        }
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Suffix chains from coarsest to finest. Each step is a factor of
/// `1024` (binary) or `1000` (decimal).
const BINARY: &[&str] = &["Ei", "Pi", "Ti", "Gi", "Mi", "Ki", ""];
const DECIMAL: &[&str] = &["E", "P", "T", "G", "M", "k", ""];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory {
    amount: u64,
    suffix: &'static str,
}

fn chain_of(suffix: &str) -> Option<(&'static [&'static str], usize, u64)> {
    if let Some(i) = BINARY.iter().position(|s| *s == suffix) {
        return Some((BINARY, i, 1024));
    }
    DECIMAL
        .iter()
        .position(|s| *s == suffix)
        .map(|i| (DECIMAL, i, 1000))
}

impl Memory {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || HealError::InvalidQuantity(s.to_string());
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        let (chain, mut idx, step) = chain_of(suffix).ok_or_else(invalid)?;

        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && frac.is_empty()) || frac.contains('.') {
            return Err(invalid());
        }
        let digits = format!("{whole}{frac}");
        let mut numerator: u128 = digits.parse().map_err(|_| invalid())?;
        let denominator = u32::try_from(frac.len())
            .ok()
            .and_then(|n| 10u128.checked_pow(n))
            .ok_or_else(invalid)?;

        // Move to finer units until the amount is whole.
        while numerator % denominator != 0 && idx + 1 < chain.len() {
            numerator = numerator.checked_mul(step as u128).ok_or_else(invalid)?;
            idx += 1;
        }
        let amount = numerator.div_ceil(denominator);
        let amount = u64::try_from(amount).map_err(|_| invalid())?;
        Ok(Self {
            amount,
            suffix: chain[idx],
        })
    }

    pub fn scale(self, factor: u32) -> Result<Self> {
        let amount = self
            .amount
            .checked_mul(u64::from(factor))
            .ok_or_else(|| HealError::InvalidQuantity(self.to_string()))?;
        Ok(Self { amount, ..self })
    }

    pub fn half(self) -> Self {
        if self.amount % 2 == 0 {
            return Self {
                amount: self.amount / 2,
                ..self
            };
        }
        if let Some((chain, idx, step)) = chain_of(self.suffix) {
            if idx + 1 < chain.len() {
                if let Some(finer) = self.amount.checked_mul(step) {
                    return Self {
                        amount: finer / 2,
                        suffix: chain[idx + 1],
                    };
                }
            }
        }
        Self {
            amount: self.amount.div_ceil(2),
            ..self
        }
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.suffix)
    }
}

// ---------------------------------------------------------------------------
// Manifest transform
// ---------------------------------------------------------------------------

/// Server-managed `metadata` fields dropped before a manifest is resubmitted.
const SERVER_METADATA_FIELDS: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
];

/// One scaled resource on one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceChange {
    pub resource: String,
    pub previous_limit: Option<String>,
    pub previous_request: Option<String>,
    pub limit: String,
    pub request: String,
}

pub fn strip_server_fields(manifest: &mut Value) {
    let Some(obj) = manifest.as_object_mut() else {
        return;
    };
    obj.remove("status");
    if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in SERVER_METADATA_FIELDS {
            meta.remove(*field);
        }
    }
}

fn quantity_str(resources: &Value, section: &str, name: &str) -> Option<String> {
    match resources.get(section)?.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Multiply the CPU and memory limits of `container` by `factor` and set each
/// request to half the new limit. A resource with only a request is scaled
/// from the request.
pub fn scale_container(
    manifest: &mut Value,
    container: &str,
    factor: u32,
) -> Result<Vec<ResourceChange>> {
    let name = manifest_name(manifest);
    let containers = manifest
        .get_mut("spec")
        .and_then(|s| s.get_mut("containers"))
        .and_then(Value::as_array_mut)
        .ok_or_else(|| HealError::InvalidManifest(format!("{name}: no spec.containers")))?;
    let target = containers
        .iter_mut()
        .find(|c| c.get("name").and_then(Value::as_str) == Some(container))
        .ok_or_else(|| HealError::ContainerNotFound {
            resource: name.clone(),
            container: container.to_string(),
        })?;

    if !target.is_object() {
        return Err(HealError::InvalidManifest(format!(
            "{name}: container is not an object"
        )));
    }
    let resources = &mut target["resources"];
    let well_formed = match resources {
        Value::Null => true,
        Value::Object(map) => ["limits", "requests"]
            .iter()
            .all(|k| map.get(*k).map_or(true, |v| v.is_object() || v.is_null())),
        _ => false,
    };
    if !well_formed {
        return Err(HealError::InvalidManifest(format!(
            "{name}: malformed resources on container '{container}'"
        )));
    }
    let snapshot = resources.clone();

    let mut changes = Vec::new();
    for resource in ["cpu", "memory"] {
        let previous_limit = quantity_str(&snapshot, "limits", resource);
        let previous_request = quantity_str(&snapshot, "requests", resource);
        let Some(base) = previous_limit.as_ref().or(previous_request.as_ref()) else {
            continue;
        };
        let (limit, request) = match resource {
            "cpu" => {
                let limit = Cpu::parse(base)?.scale(factor)?;
                (limit.to_string(), limit.half().to_string())
            }
            _ => {
                let limit = Memory::parse(base)?.scale(factor)?;
                (limit.to_string(), limit.half().to_string())
            }
        };
        resources["limits"][resource] = Value::String(limit.clone());
        resources["requests"][resource] = Value::String(request.clone());
        changes.push(ResourceChange {
            resource: resource.to_string(),
            previous_limit,
            previous_request,
            limit,
            request,
        });
    }

    if changes.is_empty() {
        return Err(HealError::NothingToScale(container.to_string()));
    }
    Ok(changes)
}

/// Build the manifest to recreate from a fetched spec: server fields removed,
/// `container` scaled by `factor`. The input is left untouched.
pub fn prepare_recreate(
    spec: &Value,
    container: &str,
    factor: u32,
) -> Result<(Value, Vec<ResourceChange>)> {
    if spec.get("metadata").and_then(|m| m.get("name")).is_none() {
        return Err(HealError::InvalidManifest(
            "fetched spec has no metadata.name".to_string(),
        ));
    }
    let mut manifest = spec.clone();
    strip_server_fields(&mut manifest);
    let changes = scale_container(&mut manifest, container, factor)?;
    Ok((manifest, changes))
}

fn manifest_name(manifest: &Value) -> String {
    let meta = manifest.get("metadata");
    let ns = meta
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .unwrap_or("default");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>");
    format!("{ns}/{name}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
