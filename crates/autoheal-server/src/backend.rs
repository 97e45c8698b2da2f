//! Backend collaborators and their shipped adapters.
//!
//! Every trait here is a seam: the pipeline only talks to `dyn` backends, and
//! tests substitute spies. Callers wrap each call in
//! [`with_timeout`](crate::error::with_timeout); adapters spawn children with
//! `kill_on_drop` so an expired deadline also stops the process.

use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use autoheal_core::config::{Config, OrchestratorConfig, WarehouseConfig};
use autoheal_core::types::{ResourceRef, SourceKind, TelemetryEvent};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Result, ServerError};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Events with `start_ms <= timestamp <= end_ms`.
    async fn fetch(&self, start_ms: i64, end_ms: i64) -> Result<Vec<TelemetryEvent>>;
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Run one SQL statement; returns whatever the driver printed.
    async fn execute(&self, sql: &str) -> Result<String>;
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn get_spec(&self, resource: &ResourceRef) -> Result<Value>;
    async fn delete(&self, resource: &ResourceRef) -> Result<()>;
    /// Create the object described by `manifest`.
    async fn apply(&self, manifest: &Value) -> Result<()>;
    async fn ping(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Process helper
// ---------------------------------------------------------------------------

struct Output {
    stdout: String,
    stderr: String,
    code: Option<i32>,
}

impl Output {
    fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn failure_message(&self, what: &str) -> String {
        let code = self
            .code
            .map(|c| format!("exited with code {c}"))
            .unwrap_or_else(|| "terminated by signal".to_string());
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if detail.is_empty() {
            format!("{what} {code}")
        } else {
            format!("{what} {code}: {detail}")
        }
    }
}

async fn run_process(
    backend: &'static str,
    program: &str,
    args: &[String],
    stdin: Option<Vec<u8>>,
) -> Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| ServerError::connection(backend, format!("failed to spawn '{program}': {e}")))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // The child reads stdin to EOF before writing anything large, so a
        // plain write before waiting cannot deadlock on manifests of this size.
        pipe.write_all(&input)
            .await
            .map_err(|e| ServerError::connection(backend, format!("stdin write failed: {e}")))?;
        drop(pipe);
    }

    let out = child
        .wait_with_output()
        .await
        .map_err(|e| ServerError::connection(backend, format!("wait failed: {e}")))?;
    Ok(Output {
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        code: out.status.code(),
    })
}

// ---------------------------------------------------------------------------
// HTTP telemetry
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum TelemetryResponse {
    Wrapped { events: Vec<TelemetryEvent> },
    Bare(Vec<TelemetryEvent>),
}

/// Telemetry query endpoint: `GET <endpoint>?start_ms=..&end_ms=..`.
pub struct HttpTelemetry {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTelemetry {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetry {
    async fn fetch(&self, start_ms: i64, end_ms: i64) -> Result<Vec<TelemetryEvent>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("start_ms", start_ms), ("end_ms", end_ms)])
            .send()
            .await
            .map_err(|e| ServerError::connection("telemetry", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(300).collect();
            return Err(ServerError::connection(
                "telemetry",
                format!("query returned {status}: {body}"),
            ));
        }

        let parsed: TelemetryResponse = response
            .json()
            .await
            .map_err(|e| ServerError::Execution(format!("malformed telemetry response: {e}")))?;
        Ok(match parsed {
            TelemetryResponse::Wrapped { events } | TelemetryResponse::Bare(events) => events,
        })
    }
}

// ---------------------------------------------------------------------------
// CLI warehouse
// ---------------------------------------------------------------------------

/// SQL CLI invoked once per statement: `argv... <sql>`.
pub struct CliWarehouse {
    argv: Vec<String>,
}

impl CliWarehouse {
    pub fn new(config: &WarehouseConfig) -> Self {
        Self {
            argv: config.argv.clone(),
        }
    }
}

#[async_trait]
impl Warehouse for CliWarehouse {
    async fn execute(&self, sql: &str) -> Result<String> {
        let (program, base) = self
            .argv
            .split_first()
            .ok_or_else(|| ServerError::connection("warehouse", "no warehouse command configured"))?;
        let mut args = base.to_vec();
        args.push(sql.to_string());

        let out = run_process("warehouse", program, &args, None).await?;
        if !out.success() {
            return Err(ServerError::Execution(out.failure_message("warehouse query")));
        }
        Ok(out.stdout)
    }
}

// ---------------------------------------------------------------------------
// kubectl orchestrator
// ---------------------------------------------------------------------------

/// `kubectl` driven through argv; manifests travel as JSON on stdin.
pub struct Kubectl {
    program: String,
    context: Option<String>,
}

impl Kubectl {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            program: config.kubectl.clone(),
            context: config.context.clone(),
        }
    }

    fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = Vec::new();
        if let Some(ctx) = &self.context {
            args.push("--context".to_string());
            args.push(ctx.clone());
        }
        args.extend(rest.into_iter().map(Into::into));
        args
    }

    async fn kubectl(&self, args: Vec<String>, stdin: Option<Vec<u8>>) -> Result<String> {
        let verb = args
            .iter()
            .find(|a| !a.starts_with('-'))
            .map_or("", String::as_str);
        let what = format!("kubectl {verb}");
        let out = run_process("orchestrator", &self.program, &args, stdin).await?;
        if !out.success() {
            return Err(ServerError::Execution(out.failure_message(&what)));
        }
        Ok(out.stdout)
    }
}

static DNS_NAME: OnceLock<Regex> = OnceLock::new();

fn is_dns_name(s: &str) -> bool {
    DNS_NAME
        .get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9.\-]{0,251}[a-z0-9])?$").unwrap())
        .is_match(s)
}

/// Names handed to kubectl must be DNS names so they can never read as flags.
fn checked(resource: &ResourceRef) -> Result<()> {
    for part in [&resource.kind, &resource.namespace, &resource.name] {
        if !is_dns_name(part) {
            return Err(ServerError::Execution(format!(
                "refusing to address {resource}: '{part}' is not a valid name"
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl Orchestrator for Kubectl {
    async fn get_spec(&self, resource: &ResourceRef) -> Result<Value> {
        checked(resource)?;
        let args = self.args([
            "get",
            resource.kind.as_str(),
            resource.name.as_str(),
            "-n",
            resource.namespace.as_str(),
            "-o",
            "json",
        ]);
        let stdout = self.kubectl(args, None).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| ServerError::Execution(format!("kubectl returned invalid JSON: {e}")))
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        checked(resource)?;
        let args = self.args([
            "delete",
            resource.kind.as_str(),
            resource.name.as_str(),
            "-n",
            resource.namespace.as_str(),
            "--wait=true",
        ]);
        self.kubectl(args, None).await.map(|_| ())
    }

    async fn apply(&self, manifest: &Value) -> Result<()> {
        let data = serde_json::to_vec(manifest)
            .map_err(|e| ServerError::Execution(format!("cannot encode manifest: {e}")))?;
        let args = self.args(["apply", "-f", "-"]);
        self.kubectl(args, Some(data)).await.map(|_| ())
    }

    async fn ping(&self) -> Result<()> {
        let args = self.args(["version"]);
        self.kubectl(args, None).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Preflight
// ---------------------------------------------------------------------------

/// Executables the configured sources need that are not on `PATH`.
pub fn missing_tools(config: &Config) -> Vec<String> {
    let mut wanted = Vec::new();
    if config.uses_kind(SourceKind::Warehouse) {
        if let Some(program) = config.warehouse.argv.first() {
            wanted.push(program.clone());
        }
    }
    if config.uses_kind(SourceKind::Orchestrator) {
        wanted.push(config.orchestrator.kubectl.clone());
    }
    wanted
        .into_iter()
        .filter(|program| which::which(program).is_err())
        .collect()
}
