use std::sync::Arc;

use async_trait::async_trait;
use autoheal_core::config::AnalysisBackend;

use crate::http::HttpProvider;
use crate::process::CommandProvider;
use crate::Result;

/// One prompt for the analysis service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
}

/// An opaque text completion service.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Build the provider selected in config.
pub fn from_backend(backend: &AnalysisBackend) -> Arc<dyn CompletionProvider> {
    match backend {
        AnalysisBackend::Http {
            endpoint,
            model,
            api_key_env,
            temperature,
            max_tokens,
        } => {
            let api_key = std::env::var(api_key_env).ok().filter(|k| !k.is_empty());
            if api_key.is_none() {
                tracing::warn!(
                    env = %api_key_env,
                    "no API key in environment, calling analysis endpoint unauthenticated"
                );
            }
            Arc::new(HttpProvider::new(
                endpoint.clone(),
                model.clone(),
                api_key,
                *temperature,
                *max_tokens,
            ))
        }
        AnalysisBackend::Command { argv } => Arc::new(CommandProvider::new(argv.clone())),
    }
}
