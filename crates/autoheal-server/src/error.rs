use std::future::Future;
use std::time::Duration;

use autoheal_agent::AgentError;
use autoheal_core::HealError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ServerError: runtime failure taxonomy
// ---------------------------------------------------------------------------

/// Failures raised while running the pipeline. None of them is fatal to the
/// process: each variant has a local recovery (degrade a source, drop a
/// record, abort an attempt, retry with feedback).
#[derive(Debug, Error)]
pub enum ServerError {
    /// A backend could not be reached or returned a transport-level error.
    #[error("{backend} unavailable: {message}")]
    Connection {
        backend: &'static str,
        message: String,
    },

    #[error("could not extract incident: {0}")]
    Extraction(String),

    #[error("classification failed: {0}")]
    Classifier(#[from] AgentError),

    /// The backend was reached and rejected the command.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error(transparent)]
    Core(#[from] HealError),
}

impl ServerError {
    pub fn connection(backend: &'static str, message: impl ToString) -> Self {
        ServerError::Connection {
            backend,
            message: message.to_string(),
        }
    }

    /// Whether a later attempt at the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Timeout { .. } | ServerError::Connection { .. } => true,
            ServerError::Classifier(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Run `fut` under a deadline. Expiry becomes [`ServerError::Timeout`].
pub async fn with_timeout<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ServerError::Timeout { operation, after }),
    }
}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

/// Private sentinel carrying an explicit 400 through the `anyhow::Error` chain.
#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.downcast_ref::<BadRequestError>().is_some() {
            StatusCode::BAD_REQUEST
        } else if let Some(e) = self.0.downcast_ref::<HealError>() {
            match e {
                HealError::NotInitialized => StatusCode::BAD_REQUEST,
                HealError::UnknownSource(_) => StatusCode::NOT_FOUND,
                HealError::InvalidConfig(_)
                | HealError::InvalidSlug(_)
                | HealError::InvalidSourceKind(_)
                | HealError::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        } else if let Some(e) = self.0.downcast_ref::<ServerError>() {
            match e {
                ServerError::Connection { .. } | ServerError::Timeout { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_expiry_is_retryable() {
        let err = with_timeout("telemetry fetch", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::Timeout { operation: "telemetry fetch", .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn inner_result_passes_through() {
        let value = with_timeout("noop", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn execution_is_not_retryable() {
        assert!(!ServerError::Execution("denied".into()).is_retryable());
        assert!(ServerError::connection("warehouse", "refused").is_retryable());
    }

    #[test]
    fn dropped_records_and_failed_checks_are_not_retryable() {
        let err = ServerError::Extraction("no pod name".into());
        assert_eq!(err.to_string(), "could not extract incident: no pod name");
        assert!(!err.is_retryable());
        assert!(!ServerError::Verification("table missing".into()).is_retryable());
    }

    #[test]
    fn not_initialized_maps_to_400() {
        let response = AppError(HealError::NotInitialized.into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unknown_source_maps_to_404() {
        let response = AppError(HealError::UnknownSource("x".into()).into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn connection_maps_to_503() {
        let response =
            AppError(ServerError::connection("orchestrator", "no route").into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn ledger_error_maps_to_500() {
        let response = AppError(HealError::Ledger("locked".into()).into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn bad_request_constructor_maps_to_400() {
        let response = AppError::bad_request("limit must be positive").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn response_body_is_json() {
        let response = AppError(anyhow::anyhow!("boom")).into_response();
        let ct = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .expect("should have content-type");
        assert!(ct.to_str().unwrap().contains("application/json"));
    }
}
