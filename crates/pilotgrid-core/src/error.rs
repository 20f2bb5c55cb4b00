//! Error types returned by the collaborator contracts.

use thiserror::Error;

use crate::types::VmId;

/// Errors from `Scheduler` implementations.
#[derive(Debug, Error)]
pub enum SchedulingError {
    /// Capacity or policy said no; nothing was reserved.
    #[error("resource request denied: {0}")]
    Denied(String),

    #[error("unknown vm: {0}")]
    UnknownVm(VmId),

    #[error("unknown coscheduling group: {0}")]
    UnknownCosched(String),

    #[error("scheduler failure: {0}")]
    Internal(String),
}

/// Errors from `BindingAdapter` implementations.
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("request exceeds policy: {0}")]
    Denied(String),
}

/// Errors from `NetworkAdapter` implementations.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    #[error("no free addresses on network: {0}")]
    Exhausted(String),

    #[error("vm has no id assigned: {0}")]
    Unassigned(String),
}

/// Errors from `AccountingAdapter` implementations.
#[derive(Debug, Error)]
pub enum AccountingError {
    #[error("charge denied: {0}")]
    Denied(String),

    #[error("accounting failure: {0}")]
    Internal(String),
}

/// Errors from `InstanceHome` implementations.
#[derive(Debug, Error)]
pub enum HomeError {
    #[error("instance not found: {0}")]
    NotFound(VmId),

    #[error("instance already exists: {0}")]
    Exists(VmId),

    #[error("instance storage failure: {0}")]
    Storage(String),
}

/// Errors from `Authorizer` implementations.
#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("not authorized: {0}")]
    Denied(String),
}

/// Errors from `AsyncRequestManager` implementations.
#[derive(Debug, Error)]
pub enum AsyncRequestError {
    #[error("async request rejected: {0}")]
    Rejected(String),
}
