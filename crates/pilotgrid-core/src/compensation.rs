//! Outcome of a best-effort rollback.
//!
//! Backout steps never abort each other: each one is recorded here as done
//! or failed, and the whole result is logged once at the end. The original
//! failure that triggered the rollback is what propagates to the caller.

use std::fmt::Display;

use tracing::{debug, warn};

/// One failed backout step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationFailure {
    pub step: String,
    pub cause: String,
}

/// Accumulated result of a compensation chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationResult {
    operation: String,
    completed: Vec<String>,
    failures: Vec<CompensationFailure>,
}

impl CompensationResult {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            completed: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn succeeded(&mut self, step: impl Into<String>) {
        self.completed.push(step.into());
    }

    pub fn failed(&mut self, step: impl Into<String>, cause: impl Display) {
        self.failures.push(CompensationFailure {
            step: step.into(),
            cause: cause.to_string(),
        });
    }

    /// Record a step from its result.
    pub fn record<E: Display>(&mut self, step: impl Into<String>, result: Result<(), E>) {
        match result {
            Ok(()) => self.succeeded(step),
            Err(e) => self.failed(step, e),
        }
    }

    /// Fold another chain's steps into this one.
    pub fn merge(&mut self, other: CompensationResult) {
        self.completed.extend(other.completed);
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    pub fn failures(&self) -> &[CompensationFailure] {
        &self.failures
    }

    /// Emit a single log line summarizing the chain.
    pub fn log(&self) {
        if self.is_clean() {
            debug!(
                operation = %self.operation,
                steps = self.completed.len(),
                "compensation completed"
            );
        } else {
            let failed: Vec<String> = self
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.step, f.cause))
                .collect();
            warn!(
                operation = %self.operation,
                completed = self.completed.len(),
                failed = ?failed,
                "compensation partially failed"
            );
        }
    }
}
