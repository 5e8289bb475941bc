use std::sync::Arc;

use support::time::Duration;

/// Failure classes of a refresh. Clonable so one outcome can be handed to
/// every caller that attached to the same refresh.
#[derive(Debug, Clone, derive_more::Display)]
pub enum UpdateError {
    /// Temporary communication problem. Retried on the next cycle.
    #[display("communication with the source failed: {_0}")]
    Transient(String),

    /// The fetch exceeded its time budget. Retried like a transient
    /// failure, logged distinctly.
    #[display("fetch did not complete within {_0}")]
    Timeout(Duration),

    /// Credentials were rejected. Not retried on schedule; the user has to
    /// reauthenticate.
    #[display("authentication rejected: {_0}")]
    Auth(String),

    /// Anything the adapter did not anticipate. Carries the full error
    /// chain for the log.
    #[display("unexpected source failure: {_0}")]
    Unexpected(Arc<anyhow::Error>),
}

impl UpdateError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn unexpected(error: anyhow::Error) -> Self {
        Self::Unexpected(Arc::new(error))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, UpdateError::Auth(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, UpdateError::Transient(_) | UpdateError::Timeout(_))
    }
}

impl std::error::Error for UpdateError {}

/// The first refresh of a source failed during setup. The owning entry
/// aborts its setup and retries later instead of loading dead entities.
#[derive(Debug, derive_more::Display)]
#[display("{coordinator} is not ready: {cause}")]
pub struct NotReady {
    pub coordinator: String,
    pub cause: UpdateError,
}

impl std::error::Error for NotReady {}
