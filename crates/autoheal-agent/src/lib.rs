//! `autoheal-agent`: root-cause classification against an external analysis
//! service.
//!
//! # Architecture
//!
//! ```text
//! Incident (+ feedback from failed attempts)
//!     │
//!     ▼
//! prompt::build_request   ← per source kind: SQL grants or scale_resources steps
//!     │
//!     ▼
//! CompletionProvider      ← HttpProvider (chat completions) | CommandProvider (stdin/stdout)
//!     │                      bounded by a timeout
//!     ▼
//! analysis::parse_response ← fenced JSON, then bare JSON, then inert RawCommand
//!     │
//!     ▼
//! Analysis
//! ```

pub mod classifier;
pub mod error;
pub mod http;
pub mod process;
pub mod prompt;
pub mod provider;

pub use classifier::Classifier;
pub use error::AgentError;
pub use http::HttpProvider;
pub use process::CommandProvider;
pub use provider::{from_backend, CompletionProvider, CompletionRequest};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, AgentError>;
