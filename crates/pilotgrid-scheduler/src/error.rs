//! Scheduler error types.

use pilotgrid_core::SchedulingError;
use pilotgrid_pilot::SlotError;
use pilotgrid_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl From<SchedulerError> for SchedulingError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Slot(SlotError::Denied(msg)) => SchedulingError::Denied(msg),
            other => SchedulingError::Internal(other.to_string()),
        }
    }
}
