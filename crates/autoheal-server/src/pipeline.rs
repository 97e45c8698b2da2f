//! Pipeline orchestrator: one polling loop per source feeding the remediation
//! queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use autoheal_agent::{from_backend, Classifier, CompletionProvider};
use autoheal_core::config::{Config, FeedbackConfig};
use autoheal_core::extract::{extract, Extraction};
use autoheal_core::handoff::{self, HandoffRecord};
use autoheal_core::ledger::AttemptDb;
use autoheal_core::paths;
use autoheal_core::types::Incident;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::backend::{CliWarehouse, Kubectl, Orchestrator, TelemetrySource, Warehouse};
use crate::error::{Result, ServerError};
use crate::executor::Executor;
use crate::feedback::{wait_for_shutdown, FeedbackLoop, LoopState};
use crate::queue::{self, DispatchSummary, Dispatcher, Handoff};
use crate::scanner::{RawRecord, SourceReader};
use crate::state::StatusBoard;
use crate::verifier::Verifier;

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// The external collaborators a pipeline talks to.
pub struct Backends {
    pub warehouse: Arc<dyn Warehouse>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub analysis: Arc<dyn CompletionProvider>,
    /// Per-source telemetry overrides. Sources without one use the HTTP
    /// adapter for their configured endpoint.
    pub telemetry: HashMap<String, Arc<dyn TelemetrySource>>,
}

impl Backends {
    pub fn from_config(config: &Config) -> Self {
        Self {
            warehouse: Arc::new(CliWarehouse::new(&config.warehouse)),
            orchestrator: Arc::new(Kubectl::new(&config.orchestrator)),
            analysis: from_backend(&config.analysis),
            telemetry: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub sources: usize,
    pub dispatch: DispatchSummary,
}

pub struct Pipeline {
    root: PathBuf,
    config: Config,
    backends: Backends,
    status: StatusBoard,
    ledger: Option<Arc<AttemptDb>>,
}

/// What every source loop shares.
struct LoopContext {
    classifier: Classifier,
    status: StatusBoard,
    handoff_path: PathBuf,
    backoff: FeedbackConfig,
}

impl Pipeline {
    pub fn new(
        root: impl Into<PathBuf>,
        config: Config,
        backends: Backends,
        status: StatusBoard,
        ledger: Option<Arc<AttemptDb>>,
    ) -> Self {
        Self {
            root: root.into(),
            config,
            backends,
            status,
            ledger,
        }
    }

    pub fn handoff_path(&self) -> PathBuf {
        match &self.config.handoff_file {
            Some(p) => paths::resolve(&self.root, p),
            None => paths::default_handoff_path(&self.root),
        }
    }

    /// Run every source loop and the dispatcher until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<RunSummary> {
        let config = &self.config;
        let timeouts = &config.timeouts;

        let mut readers = Vec::with_capacity(config.sources.len());
        for source in &config.sources {
            let reader = SourceReader::open(
                &self.root,
                source,
                source.poll_interval(config.poll_interval_secs),
                timeouts.telemetry(),
                self.backends.telemetry.get(&source.id).cloned(),
            )?;
            self.status
                .register_source(&reader.id, reader.kind, reader.feed_name());
            readers.push(reader);
        }

        let classifier = Classifier::new(self.backends.analysis.clone(), timeouts.analysis());
        let controller = Arc::new(FeedbackLoop::new(
            classifier.clone(),
            Executor::new(
                self.backends.warehouse.clone(),
                self.backends.orchestrator.clone(),
                timeouts.clone(),
            ),
            Verifier::new(
                self.backends.warehouse.clone(),
                self.backends.orchestrator.clone(),
                config.warehouse.liveness_sql.clone(),
                timeouts.clone(),
            ),
            self.ledger.clone(),
            config.feedback.clone(),
            self.status.clone(),
        ));

        let (tx, rx) = queue::channel(config.queue.capacity);
        let dispatcher = tokio::spawn(
            Dispatcher::new(
                rx,
                controller,
                config.queue.capacity,
                config.queue.max_concurrent,
                shutdown.clone(),
            )
            .run(),
        );

        let ctx = Arc::new(LoopContext {
            classifier,
            status: self.status.clone(),
            handoff_path: self.handoff_path(),
            backoff: config.feedback.clone(),
        });
        let sources = readers.len();
        tracing::info!(
            sources,
            handoff = %ctx.handoff_path.display(),
            "pipeline started"
        );

        let mut loops = JoinSet::new();
        for reader in readers {
            loops.spawn(source_loop(reader, ctx.clone(), tx.clone(), shutdown.clone()));
        }
        drop(tx);

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "source loop failed");
            }
        }
        let dispatch = match dispatcher.await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(error = %e, "dispatcher failed");
                DispatchSummary::default()
            }
        };
        tracing::info!(
            fixed = dispatch.fixed,
            exhausted = dispatch.exhausted,
            escalated = dispatch.escalated,
            abandoned = dispatch.abandoned,
            "pipeline stopped"
        );
        Ok(RunSummary { sources, dispatch })
    }
}

// ---------------------------------------------------------------------------
// Source loop
// ---------------------------------------------------------------------------

async fn source_loop(
    mut reader: SourceReader,
    ctx: Arc<LoopContext>,
    tx: mpsc::Sender<Handoff>,
    mut shutdown: watch::Receiver<bool>,
) {
    let source = reader.id.clone();
    tracing::info!(
        source = %source,
        kind = %reader.kind,
        feed = reader.feed_name(),
        interval_secs = reader.poll_interval.as_secs(),
        "source loop started"
    );

    let mut ticker = tokio::time::interval(reader.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'poll: loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        let now_ms = Utc::now().timestamp_millis();
        let polled = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            polled = reader.next_records(now_ms) => polled,
        };
        let records = match polled {
            Ok(records) => {
                ctx.status.poll_succeeded(&source, records.len());
                records
            }
            Err(e) => {
                let failures = ctx.status.poll_failed(&source, &e.to_string());
                let delay = ctx.backoff.backoff(failures);
                tracing::warn!(
                    source = %source,
                    error = %e,
                    failures,
                    retryable = e.is_retryable(),
                    delay_ms = delay.as_millis() as u64,
                    "poll failed, source degraded"
                );
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        for record in records {
            let end_offset = record.end_offset;
            if !process_record(&reader, record, &ctx, &tx, &mut shutdown).await {
                break 'poll;
            }
            if let Err(e) = reader.acknowledge(end_offset) {
                tracing::warn!(source = %source, error = %e, "could not save cursor");
            }
        }
    }

    ctx.status.source_stopped(&source);
    tracing::info!(source = %source, "source loop stopped");
}

/// Extract, classify and enqueue one record. Returns false when the loop
/// should stop.
async fn process_record(
    reader: &SourceReader,
    record: RawRecord,
    ctx: &LoopContext,
    tx: &mpsc::Sender<Handoff>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let fields = match extract(reader.kind, &record.text) {
        Extraction::Extracted(fields) => fields,
        Extraction::Unextractable(reason) => {
            let err = ServerError::Extraction(reason);
            tracing::warn!(
                source = %reader.id,
                event = record.event_id.as_deref().unwrap_or("-"),
                error = %err,
                "dropping unextractable record"
            );
            ctx.status.unextractable(&reader.id);
            return true;
        }
    };

    let incident = Incident::new(&reader.id, record.text, fields, record.event_id.as_deref());
    tracing::info!(
        source = %reader.id,
        incident = %incident.id,
        kind = %incident.source_kind,
        "incident detected"
    );
    ctx.status.incident_detected(&incident);
    ctx.status.transition(&incident, LoopState::Detected, 0);

    ctx.status.transition(&incident, LoopState::Analyzing, 0);
    let analysis = tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown) => return false,
        analysis = ctx.classifier.analyze(&incident, None) => analysis,
    };

    mirror_handoff(&ctx.handoff_path, &incident, &analysis);

    let handoff = Handoff { incident, analysis };
    let sent = tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown) => return false,
        sent = tx.send(handoff) => sent,
    };
    if sent.is_err() {
        tracing::warn!(source = %reader.id, "remediation queue closed");
        return false;
    }
    ctx.status.handoff_queued();
    true
}

fn mirror_handoff(path: &Path, incident: &Incident, analysis: &autoheal_core::types::Analysis) {
    let record = HandoffRecord::new(incident, analysis);
    if let Err(e) = handoff::write(path, &record) {
        tracing::warn!(
            incident = %incident.id,
            path = %path.display(),
            error = %e,
            "could not write handoff file"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::{oom_pod_spec, SpyOrchestrator, SpyWarehouse};
    use async_trait::async_trait;
    use autoheal_agent::CompletionRequest;
    use autoheal_core::config::{Feed, SourceConfig};
    use autoheal_core::types::SourceKind;
    use std::time::Duration;

    struct ScaleAdvice;

    #[async_trait]
    impl CompletionProvider for ScaleAdvice {
        fn name(&self) -> &str {
            "scale-advice"
        }
        async fn complete(&self, _: &CompletionRequest) -> autoheal_agent::Result<String> {
            Ok("```json\n{\"root_cause\": \"OOM\", \"remediation_steps\": [{\"action\": \"scale_resources\"}]}\n```".into())
        }
    }

    fn config() -> Config {
        let mut config = Config::new();
        config.poll_interval_secs = 1;
        config.status.enabled = false;
        config.feedback.backoff_base_ms = 1;
        config.feedback.backoff_max_ms = 5;
        config.sources = vec![SourceConfig {
            id: "cluster".into(),
            kind: SourceKind::Orchestrator,
            feed: Feed::LogFile {
                path: "logs/cluster_errors.log".into(),
                delimiter: autoheal_core::config::default_delimiter(),
            },
            error_pattern: None,
            poll_interval_secs: None,
        }];
        config
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn oom_record_flows_to_delete_then_apply() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("logs/cluster_errors.log");
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        std::fs::write(
            &log,
            format!(
                "Error in /k8s/audit:\npod=p1 namespace=ns1 container=c1 reason: OOMKilled\n{}\n",
                "-".repeat(60)
            ),
        )
        .unwrap();

        let orch = Arc::new(SpyOrchestrator::new(oom_pod_spec()));
        let backends = Backends {
            warehouse: Arc::new(SpyWarehouse::default()),
            orchestrator: orch.clone(),
            analysis: Arc::new(ScaleAdvice),
            telemetry: HashMap::new(),
        };
        let status = StatusBoard::default();
        let pipeline = Pipeline::new(dir.path(), config(), backends, status.clone(), None);
        let handoff_path = pipeline.handoff_path();

        let (stop, shutdown) = watch::channel(false);
        let run = tokio::spawn(pipeline.run(shutdown));

        wait_until(|| status.snapshot().counters.fixed == 1).await;
        stop.send(true).unwrap();
        let summary = run.await.unwrap().unwrap();

        assert_eq!(summary.sources, 1);
        let mutating: Vec<String> = orch
            .calls()
            .into_iter()
            .filter(|c| !c.starts_with("get"))
            .collect();
        assert_eq!(mutating, vec!["delete p1 ns1", "apply"]);
        let applied = orch.applied.lock().unwrap()[0].clone();
        let resources = &applied["spec"]["containers"][0]["resources"];
        assert_eq!(resources["limits"]["cpu"], "1000m");
        assert_eq!(resources["requests"]["memory"], "512Mi");

        let record = handoff::read(&handoff_path).unwrap().unwrap();
        assert_eq!(record.root_cause, "OOM");
        assert_eq!(record.source, "cluster");
        assert_eq!(
            record.manifest_ref.unwrap().to_string(),
            "pod ns1/p1 (container c1)"
        );
    }

    #[tokio::test]
    async fn unextractable_records_are_dropped() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("logs/cluster_errors.log");
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        std::fs::write(&log, format!("something odd happened\n{}\n", "-".repeat(60))).unwrap();

        let orch = Arc::new(SpyOrchestrator::new(oom_pod_spec()));
        let backends = Backends {
            warehouse: Arc::new(SpyWarehouse::default()),
            orchestrator: orch.clone(),
            analysis: Arc::new(ScaleAdvice),
            telemetry: HashMap::new(),
        };
        let status = StatusBoard::default();
        let pipeline = Pipeline::new(dir.path(), config(), backends, status.clone(), None);
        let (stop, shutdown) = watch::channel(false);
        let run = tokio::spawn(pipeline.run(shutdown));

        wait_until(|| status.snapshot().counters.unextractable == 1).await;
        stop.send(true).unwrap();
        run.await.unwrap().unwrap();

        assert_eq!(status.snapshot().counters.incidents, 0);
        assert!(orch.calls().is_empty());
    }

    struct NeverAnswers;

    #[async_trait]
    impl CompletionProvider for NeverAnswers {
        fn name(&self) -> &str {
            "never-answers"
        }
        async fn complete(&self, _: &CompletionRequest) -> autoheal_agent::Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn record_interrupted_by_shutdown_is_read_again() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("logs/cluster_errors.log");
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        let delimiter = autoheal_core::config::default_delimiter();
        std::fs::write(
            &log,
            format!(
                "pod=p1 namespace=ns1 container=c1 OOMKilled\n{delimiter}\n\
                 pod=p2 namespace=ns1 container=c1 OOMKilled\n{delimiter}\n"
            ),
        )
        .unwrap();

        let backends = Backends {
            warehouse: Arc::new(SpyWarehouse::default()),
            orchestrator: Arc::new(SpyOrchestrator::new(oom_pod_spec())),
            analysis: Arc::new(NeverAnswers),
            telemetry: HashMap::new(),
        };
        let status = StatusBoard::default();
        let pipeline = Pipeline::new(dir.path(), config(), backends, status.clone(), None);
        let (stop, shutdown) = watch::channel(false);
        let run = tokio::spawn(pipeline.run(shutdown));

        wait_until(|| status.snapshot().counters.incidents == 1).await;
        stop.send(true).unwrap();
        run.await.unwrap().unwrap();

        let mut tracker = autoheal_core::cursor::CursorTracker::open(
            "cluster",
            log,
            autoheal_core::paths::cursor_path(dir.path(), "cluster"),
            delimiter,
        )
        .unwrap();
        assert_eq!(tracker.offset(), 0);
        assert_eq!(tracker.read_new().unwrap().records.len(), 2);
    }
}
