use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("analysis service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected analysis service response: {0}")]
    Response(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("analysis service did not answer within {0:?}")]
    Timeout(Duration),
}

impl AgentError {
    /// Timeouts and transport failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Timeout(_) | AgentError::Http(_) => true,
            AgentError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
