//! Creation error types.

use pilotgrid_core::*;
use pilotgrid_state::StateError;
use thiserror::Error;

/// Errors surfaced by [`CreationManager`](crate::CreationManager).
///
/// Whatever the variant, the caller never receives partially created
/// state: everything committed before the failure has been compensated.
#[derive(Debug, Error)]
pub enum CreationError {
    /// Malformed request or caller. Nothing was created.
    #[error("invalid request: {0}")]
    Request(String),

    /// Policy or capacity refused the request.
    #[error("request denied: {0}")]
    Denied(String),

    /// The client token is already bound to a different request.
    #[error("client token {token:?} was used for a different request: {reason}")]
    IdempotentMismatch { token: String, reason: String },

    #[error("instance not found: {0}")]
    NotFound(VmId),

    #[error("scheduling failed: {0}")]
    Scheduling(String),

    #[error("network allocation failed: {0}")]
    Network(#[from] NetworkError),

    #[error("accounting failed: {0}")]
    Accounting(#[from] AccountingError),

    /// An instance could not be persisted; earlier ones were destroyed.
    #[error("instance materialization failed: {source}")]
    Materialization {
        #[source]
        source: HomeError,
    },

    /// Gave up waiting for another request holding the same client token.
    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type CreationResult<T> = Result<T, CreationError>;

impl From<SchedulingError> for CreationError {
    fn from(e: SchedulingError) -> Self {
        match e {
            SchedulingError::Denied(msg) => CreationError::Denied(msg),
            SchedulingError::UnknownCosched(id) => {
                CreationError::Request(format!("no pending ensemble {id}"))
            }
            other => CreationError::Scheduling(other.to_string()),
        }
    }
}

impl From<BindingError> for CreationError {
    fn from(e: BindingError) -> Self {
        match e {
            BindingError::Invalid(msg) => CreationError::Request(msg),
            BindingError::Denied(msg) => CreationError::Denied(msg),
        }
    }
}

impl From<AuthorizationError> for CreationError {
    fn from(e: AuthorizationError) -> Self {
        match e {
            AuthorizationError::Denied(msg) => CreationError::Denied(msg),
        }
    }
}

impl From<AsyncRequestError> for CreationError {
    fn from(e: AsyncRequestError) -> Self {
        match e {
            AsyncRequestError::Rejected(msg) => CreationError::Denied(msg),
        }
    }
}

impl From<HomeError> for CreationError {
    fn from(e: HomeError) -> Self {
        match e {
            HomeError::NotFound(id) => CreationError::NotFound(id),
            other => CreationError::Internal(other.to_string()),
        }
    }
}

impl From<StateError> for CreationError {
    fn from(e: StateError) -> Self {
        CreationError::Internal(e.to_string())
    }
}
