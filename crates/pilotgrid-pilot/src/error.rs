//! Slot manager error types.

use pilotgrid_state::{SlotTransitionError, StateError};
use thiserror::Error;

/// Errors surfaced by synchronous slot operations.
///
/// Notification callbacks never return these; they log instead.
#[derive(Debug, Error)]
pub enum SlotError {
    /// Capacity was not reserved. Nothing is left half-created.
    #[error("resource request denied: {0}")]
    Denied(String),

    #[error("batch scheduler command failed: {0}")]
    Command(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Transition(#[from] SlotTransitionError),

    #[error("notification log: {0}")]
    Log(#[from] std::io::Error),
}

pub type SlotResult<T> = Result<T, SlotError>;
