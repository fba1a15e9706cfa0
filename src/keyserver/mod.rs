//! Key registry client: public-key reads with caching and private-key
//! publication with an asynchronous approval workflow.

mod cache;
mod client;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::jwt::SignError;
use crate::keys::KeyError;

pub use cache::{InMemoryKeyCache, KeyCache};
pub use client::KeyRegistryClient;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown key {issuer}/{kid}")]
    UnknownKey { issuer: String, kid: String },

    #[error("key {issuer}/{kid} is expired")]
    ExpiredKey { issuer: String, kid: String },

    #[error("key is pending approval")]
    PendingApproval,

    #[error("unexpected key server response {status}: {body}")]
    Unexpected { status: u16, body: String },

    #[error("key server request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("publication canceled by caller")]
    Canceled,

    #[error("publication aborted by shutdown")]
    Aborted,

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Sign(#[from] SignError),
}

/// Publication options forwarded to the registry as query parameters.
#[derive(Debug, Clone, Default)]
pub struct KeyPolicy {
    /// Absolute expiration requested for the published key.
    pub expiration: Option<chrono::DateTime<chrono::Utc>>,

    /// Requested rotation interval.
    pub rotation: Option<chrono::Duration>,
}

/// Async handle to a key publication.
///
/// The background worker completes the handle exactly once with the final
/// outcome; the caller can cancel at any time, including mid-poll. Dropping
/// the handle without waiting also cancels the publication.
#[derive(Debug)]
pub struct PublishResult {
    outcome: oneshot::Receiver<Result<(), RegistryError>>,
    cancel: Option<oneshot::Sender<()>>,
}

impl PublishResult {
    pub(crate) fn new(
        outcome: oneshot::Receiver<Result<(), RegistryError>>,
        cancel: oneshot::Sender<()>,
    ) -> Self {
        Self {
            outcome,
            cancel: Some(cancel),
        }
    }

    /// A handle already resolved to the given outcome, with no worker behind
    /// it. Used when publication cannot even start.
    pub(crate) fn resolved(result: Result<(), RegistryError>) -> Self {
        let (out_tx, out_rx) = oneshot::channel();
        let (cancel_tx, _) = oneshot::channel();
        let _ = out_tx.send(result);
        Self {
            outcome: out_rx,
            cancel: Some(cancel_tx),
        }
    }

    /// Ask the worker to stop. The final outcome still arrives through
    /// `wait`, as a cancellation error if the cancel won the race.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Wait for the publication to finish.
    pub async fn wait(self) -> Result<(), RegistryError> {
        self.outcome.await.unwrap_or(Err(RegistryError::Aborted))
    }
}
