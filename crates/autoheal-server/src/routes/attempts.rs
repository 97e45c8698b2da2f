use axum::extract::{Query, State};
use axum::Json;
use autoheal_core::types::{FixAttempt, IncidentId};
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct AttemptsQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    incident: Option<String>,
}

/// GET /api/attempts?limit=N&incident=ID: recorded fix attempts, newest
/// first. Without a ledger the list is empty.
pub async fn list_attempts(
    State(app): State<AppState>,
    Query(query): Query<AttemptsQuery>,
) -> Result<Json<Vec<FixAttempt>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(AppError::bad_request(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }
    let Some(ledger) = app.ledger.clone() else {
        return Ok(Json(Vec::new()));
    };

    let attempts = tokio::task::spawn_blocking(move || match query.incident {
        Some(id) => {
            let mut attempts = ledger.for_incident(&IncidentId::new(id))?;
            attempts.reverse();
            attempts.truncate(limit);
            Ok::<_, autoheal_core::HealError>(attempts)
        }
        None => ledger.recent(limit),
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(attempts))
}
