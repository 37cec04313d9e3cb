use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub mod client;
pub mod protocol;

pub use client::{CommandReply, ImapClient, ImapConfig};
pub use protocol::{ImapResponse, ResponseStatus};

#[derive(Debug, Error)]
pub enum ImapError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("unexpected greeting: {0}")]
    Greeting(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{command} failed: {reply}")]
    Server { command: String, reply: String },

    #[error("protocol: {0}")]
    Parse(String),

    #[error("timeout during {0}")]
    Timeout(String),

    #[error("invalid session state: {0}")]
    State(String),
}

impl ImapError {
    /// Transient errors consume the retry budget; the rest abort the stage
    /// (auth) or the message (parse).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ImapError::Io(_)
                | ImapError::Timeout(_)
                | ImapError::Server { .. }
                | ImapError::Greeting(_)
                | ImapError::State(_)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ImapError::Auth(_))
    }
}

/// The two target operations the message pipeline depends on; the production
/// implementation is `ImapClient`, tests use an in-memory mailbox.
#[async_trait]
pub trait TargetMailbox: Send {
    async fn message_exists(
        &mut self,
        server_folder: &str,
        message_id: &str,
    ) -> Result<bool, ImapError>;

    async fn append(&mut self, server_folder: &str, bytes: &[u8]) -> Result<(), ImapError>;
}

#[async_trait]
impl TargetMailbox for ImapClient {
    async fn message_exists(
        &mut self,
        server_folder: &str,
        message_id: &str,
    ) -> Result<bool, ImapError> {
        ImapClient::message_exists(self, server_folder, message_id).await
    }

    async fn append(&mut self, server_folder: &str, bytes: &[u8]) -> Result<(), ImapError> {
        ImapClient::append(self, server_folder, bytes).await
    }
}

/// Fixed set of IMAP sessions shared by the upload workers. The pool size
/// matches the worker pool size, so a scan always finds a free slot quickly.
/// A leased session that failed is discarded by the caller and reconnects
/// lazily on next use.
pub struct ImapPool {
    slots: Vec<Arc<Mutex<ImapClient>>>,
}

impl ImapPool {
    pub fn new(config: ImapConfig, size: usize) -> Self {
        let slots = (0..size.max(1))
            .map(|_| Arc::new(Mutex::new(ImapClient::new(config.clone()))))
            .collect();
        Self { slots }
    }

    pub async fn lease(&self) -> OwnedMutexGuard<ImapClient> {
        loop {
            for slot in &self.slots {
                if let Ok(guard) = slot.clone().try_lock_owned() {
                    return guard;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
