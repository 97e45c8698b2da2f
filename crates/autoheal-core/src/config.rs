use crate::error::{HealError, Result};
use crate::paths;
use crate::types::SourceKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Where a source's raw error text comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Feed {
    /// Poll a telemetry query endpoint for the trailing `window_secs`.
    Telemetry {
        endpoint: String,
        #[serde(default = "default_window_secs")]
        window_secs: u64,
    },
    /// Tail an append-only log file whose records are separated by a
    /// delimiter line.
    LogFile {
        path: PathBuf,
        #[serde(default = "default_delimiter")]
        delimiter: String,
    },
}

fn default_window_secs() -> u64 {
    120
}

pub fn default_delimiter() -> String {
    "-".repeat(60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub kind: SourceKind,
    pub feed: Feed,
    /// Regex a telemetry message must match to count as an error. When
    /// absent, a per-kind default predicate is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_pattern: Option<String>,
    /// Overrides the top-level `poll_interval_secs` for this source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
}

impl SourceConfig {
    pub fn poll_interval(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(default_secs))
    }
}

// ---------------------------------------------------------------------------
// AnalysisBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisBackend {
    /// OpenAI-compatible chat completions endpoint.
    Http {
        #[serde(default = "default_analysis_endpoint")]
        endpoint: String,
        #[serde(default = "default_analysis_model")]
        model: String,
        /// Name of the environment variable holding the API key.
        #[serde(default = "default_api_key_env")]
        api_key_env: String,
        #[serde(default = "default_temperature")]
        temperature: f32,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
    },
    /// Local command: prompt on stdin, completion on stdout.
    Command { argv: Vec<String> },
}

fn default_analysis_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_analysis_model() -> String {
    "gpt-4o".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    500
}

impl Default for AnalysisBackend {
    fn default() -> Self {
        AnalysisBackend::Http {
            endpoint: default_analysis_endpoint(),
            model: default_analysis_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// SQL client invocation; the statement is appended as the last argument.
    #[serde(default = "default_warehouse_argv")]
    pub argv: Vec<String>,
    #[serde(default = "default_liveness_sql")]
    pub liveness_sql: String,
}

fn default_warehouse_argv() -> Vec<String> {
    ["snowsql", "-o", "exit_on_error=true", "-o", "friendly=false", "-q"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_liveness_sql() -> String {
    "SELECT 1;".to_string()
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            argv: default_warehouse_argv(),
            liveness_sql: default_liveness_sql(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            context: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loop tuning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Re-analysis attempts after the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl FeedbackConfig {
    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_telemetry_secs")]
    pub telemetry_secs: u64,
    #[serde(default = "default_analysis_secs")]
    pub analysis_secs: u64,
    #[serde(default = "default_warehouse_secs")]
    pub warehouse_secs: u64,
    #[serde(default = "default_orchestrator_secs")]
    pub orchestrator_secs: u64,
}

fn default_telemetry_secs() -> u64 {
    30
}

fn default_analysis_secs() -> u64 {
    60
}

fn default_warehouse_secs() -> u64 {
    30
}

fn default_orchestrator_secs() -> u64 {
    60
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            telemetry_secs: default_telemetry_secs(),
            analysis_secs: default_analysis_secs(),
            warehouse_secs: default_warehouse_secs(),
            orchestrator_secs: default_orchestrator_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn telemetry(&self) -> Duration {
        Duration::from_secs(self.telemetry_secs)
    }

    pub fn analysis(&self) -> Duration {
        Duration::from_secs(self.analysis_secs)
    }

    pub fn warehouse(&self) -> Duration {
        Duration::from_secs(self.warehouse_secs)
    }

    pub fn orchestrator(&self) -> Duration {
        Duration::from_secs(self.orchestrator_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Pending handoffs before source loops block.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Incidents remediated at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_enabled")]
    pub enabled: bool,
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_enabled() -> bool {
    true
}

fn default_status_bind() -> String {
    "127.0.0.1:8700".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_status_enabled(),
            bind: default_status_bind(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub analysis: AnalysisBackend,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub status: StatusConfig,
    /// Mirror every completed analysis into this JSON file (last write wins).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_file: Option<PathBuf>,
}

fn default_version() -> u32 {
    1
}

fn default_poll_interval_secs() -> u64 {
    15
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            version: default_version(),
            poll_interval_secs: default_poll_interval_secs(),
            sources: Vec::new(),
            analysis: AnalysisBackend::default(),
            warehouse: WarehouseConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            feedback: FeedbackConfig::default(),
            timeouts: TimeoutConfig::default(),
            queue: QueueConfig::default(),
            status: StatusConfig::default(),
            handoff_file: None,
        }
    }

    /// Starter config written by `autoheal init`: one warehouse telemetry
    /// source and one orchestrator log file.
    pub fn example() -> Self {
        let mut cfg = Self::new();
        cfg.sources = vec![
            SourceConfig {
                id: "query-history".to_string(),
                kind: SourceKind::Warehouse,
                feed: Feed::Telemetry {
                    endpoint: "http://127.0.0.1:9880/events/query-history".to_string(),
                    window_secs: default_window_secs(),
                },
                error_pattern: None,
                poll_interval_secs: None,
            },
            SourceConfig {
                id: "cluster".to_string(),
                kind: SourceKind::Orchestrator,
                feed: Feed::LogFile {
                    path: PathBuf::from("logs/cluster_errors.log"),
                    delimiter: default_delimiter(),
                },
                error_pattern: None,
                poll_interval_secs: None,
            },
        ];
        cfg.handoff_file = Some(PathBuf::from(paths::HANDOFF_FILE));
        cfg
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(HealError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        crate::io::atomic_write(&path, self.to_yaml()?.as_bytes())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn source(&self, id: &str) -> Result<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| HealError::UnknownSource(id.to_string()))
    }

    pub fn uses_kind(&self, kind: SourceKind) -> bool {
        self.sources.iter().any(|s| s.kind == kind)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.sources.is_empty() {
            warnings.push(ConfigWarning::warning("no sources configured"));
        }
        if self.poll_interval_secs == 0 {
            warnings.push(ConfigWarning::error("poll_interval_secs must be > 0"));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if paths::validate_source_id(&source.id).is_err() {
                warnings.push(ConfigWarning::error(format!(
                    "source id '{}' must be lowercase alphanumeric with hyphens",
                    source.id
                )));
            }
            if !seen.insert(source.id.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }

            let poll = source.poll_interval(self.poll_interval_secs);
            if poll.is_zero() {
                warnings.push(ConfigWarning::error(format!(
                    "source '{}' has a zero poll interval",
                    source.id
                )));
            }

            match &source.feed {
                Feed::Telemetry {
                    endpoint,
                    window_secs,
                } => {
                    if endpoint.trim().is_empty() {
                        warnings.push(ConfigWarning::error(format!(
                            "source '{}' has an empty telemetry endpoint",
                            source.id
                        )));
                    }
                    // A window shorter than two polls lets events fall between polls.
                    if Duration::from_secs(*window_secs) < poll * 2 {
                        warnings.push(ConfigWarning::error(format!(
                            "source '{}': window_secs={} must be at least twice the poll interval ({}s)",
                            source.id,
                            window_secs,
                            poll.as_secs()
                        )));
                    }
                }
                Feed::LogFile { delimiter, .. } => {
                    if delimiter.trim().is_empty() {
                        warnings.push(ConfigWarning::error(format!(
                            "source '{}' has an empty record delimiter",
                            source.id
                        )));
                    }
                }
            }

            if let Some(pattern) = &source.error_pattern {
                if let Err(e) = regex::Regex::new(pattern) {
                    warnings.push(ConfigWarning::error(format!(
                        "source '{}' has an invalid error_pattern: {e}",
                        source.id
                    )));
                }
            }
        }

        match &self.analysis {
            AnalysisBackend::Http {
                endpoint,
                api_key_env,
                ..
            } => {
                if endpoint.trim().is_empty() {
                    warnings.push(ConfigWarning::error("analysis endpoint is empty"));
                }
                if std::env::var(api_key_env).is_err() {
                    warnings.push(ConfigWarning::warning(format!(
                        "analysis API key variable '{api_key_env}' is not set"
                    )));
                }
            }
            AnalysisBackend::Command { argv } => {
                if argv.is_empty() {
                    warnings.push(ConfigWarning::error("analysis command argv is empty"));
                }
            }
        }

        if self.uses_kind(SourceKind::Warehouse) && self.warehouse.argv.is_empty() {
            warnings.push(ConfigWarning::error("warehouse argv is empty"));
        }
        if self.uses_kind(SourceKind::Orchestrator) && self.orchestrator.kubectl.trim().is_empty()
        {
            warnings.push(ConfigWarning::error("orchestrator kubectl path is empty"));
        }

        if self.feedback.max_retries > 10 {
            warnings.push(ConfigWarning::warning(format!(
                "feedback.max_retries={} (>10 is unusual)",
                self.feedback.max_retries
            )));
        }
        if self.feedback.backoff_base_ms > self.feedback.backoff_max_ms {
            warnings.push(ConfigWarning::warning(
                "feedback.backoff_base_ms exceeds backoff_max_ms; every retry waits the cap",
            ));
        }

        let t = &self.timeouts;
        for (name, secs) in [
            ("telemetry_secs", t.telemetry_secs),
            ("analysis_secs", t.analysis_secs),
            ("warehouse_secs", t.warehouse_secs),
            ("orchestrator_secs", t.orchestrator_secs),
        ] {
            if secs == 0 {
                warnings.push(ConfigWarning::error(format!("timeouts.{name} must be > 0")));
            }
        }

        if self.queue.capacity == 0 {
            warnings.push(ConfigWarning::error("queue.capacity must be > 0"));
        }
        if self.queue.max_concurrent == 0 {
            warnings.push(ConfigWarning::error("queue.max_concurrent must be > 0"));
        }

        warnings
    }
}

/// True if any entry blocks the pipeline from starting.
pub fn has_errors(warnings: &[ConfigWarning]) -> bool {
    warnings.iter().any(|w| w.level == WarnLevel::Error)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
