use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealError {
    #[error("not initialized: run 'autoheal init'")]
    NotInitialized,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid source id '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidSlug(String),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("invalid source kind: {0}")]
    InvalidSourceKind(String),

    #[error("invalid quantity '{0}'")]
    InvalidQuantity(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("container '{container}' not found in {resource}")]
    ContainerNotFound { resource: String, container: String },

    #[error("no resource limits or requests to scale on container '{0}'")]
    NothingToScale(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("attempt ledger error: {0}")]
    Ledger(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, HealError>;
