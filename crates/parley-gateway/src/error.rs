use thiserror::Error;

use crate::presence::PresenceError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// No valid bearer token on the upgrade request.
    #[error("connection is not authenticated")]
    Unauthenticated,

    /// Authenticated, but not a participant of the requested context.
    #[error("user is not allowed into this context")]
    Forbidden,

    #[error("requested context does not exist")]
    ContextNotFound,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] anyhow::Error),

    #[error("presence store unavailable: {0}")]
    StoreUnavailable(#[from] PresenceError),

    #[error("blocking worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl GatewayError {
    /// Errors raised while deciding whether a connection may open.
    pub fn is_authorization_failure(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated | Self::Forbidden | Self::ContextNotFound
        )
    }
}

/// Run a blocking store call on the bounded blocking pool so a slow store
/// never stalls the tasks serving other connections.
pub(crate) async fn run_blocking<F, T, E>(f: F) -> Result<T, GatewayError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<GatewayError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?.map_err(Into::into)
}
