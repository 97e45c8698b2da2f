//! Runtime for the self-healing pipeline: source loops, the remediation
//! queue, backend adapters and the read-only status API.

pub mod backend;
pub mod error;
pub mod executor;
pub mod feedback;
pub mod pipeline;
pub mod queue;
pub mod routes;
pub mod scanner;
pub mod state;
pub mod verifier;

use std::path::PathBuf;
use std::sync::Arc;

use autoheal_core::config::Config;
use autoheal_core::ledger::AttemptDb;
use autoheal_core::paths;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::feedback::wait_for_shutdown;
use crate::pipeline::{Backends, Pipeline, RunSummary};
use crate::state::{AppState, StatusBoard};

/// Build the axum Router for the status API.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::status::health))
        .route("/api/status", get(routes::status::get_status))
        .route("/api/attempts", get(routes::attempts::list_attempts))
        .route("/api/stop", post(routes::status::stop))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Serve the status API on a pre-bound listener until `shutdown` flips.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    app_state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("status API listening on http://{addr}");

    axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await?;
    Ok(())
}

/// Run the pipeline for the project at `root` until interrupted or stopped
/// over HTTP.
pub async fn run(root: PathBuf, config: Config) -> anyhow::Result<RunSummary> {
    let (tx, rx) = watch::channel(false);
    let status = StatusBoard::default();

    for tool in backend::missing_tools(&config) {
        tracing::warn!(tool = %tool, "not found on PATH; remediations using it will fail");
    }

    let ledger_path = paths::ledger_path(&root);
    let ledger = match AttemptDb::open(&ledger_path) {
        Ok(db) => Some(Arc::new(db)),
        Err(e) => {
            tracing::warn!(
                path = %ledger_path.display(),
                error = %e,
                "attempt ledger unavailable, attempts will not be recorded"
            );
            None
        }
    };

    let app_state = AppState::new(status.clone(), ledger.clone(), Arc::new(tx));
    {
        let app_state = app_state.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                app_state.request_shutdown();
            }
        });
    }

    let server = if config.status.enabled {
        let listener = tokio::net::TcpListener::bind(&config.status.bind).await?;
        Some(tokio::spawn(serve_on(listener, app_state.clone(), rx.clone())))
    } else {
        None
    };

    let backends = Backends::from_config(&config);
    let result = Pipeline::new(root, config, backends, status, ledger)
        .run(rx)
        .await;

    // The pipeline also ends without a signal when a source cannot be opened
    // or none are configured.
    app_state.request_shutdown();
    if let Some(server) = server {
        match server.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "status API stopped with error"),
            Err(e) => tracing::warn!(error = %e, "status API task failed"),
            Ok(Ok(())) => {}
        }
    }
    Ok(result?)
}
