use async_trait::async_trait;
use thiserror::Error;

pub mod graph;

pub use graph::{ClientCredentialsProvider, GraphClient, SourceFolder, SourceMessage};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("throttled after {attempts} attempts: {detail}")]
    Throttled { attempts: u32, detail: String },

    #[error("transport: {0}")]
    Transport(String),

    #[error("http {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("empty body for message {0}")]
    EmptyBody(String),

    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SourceError {
    /// Errors that abort the stage rather than failing one work unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Auth(_))
    }
}

/// Yields bearer tokens for the mail REST API. The production implementation
/// is an OAuth2 client-credentials flow; tests substitute a fixed token.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, SourceError>;
}
