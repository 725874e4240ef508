//! # Clamp Core
//!
//! Shared types and utilities for stimulus clamp simulation of ion-channel
//! kinetic models.
//!
//! ## Contents
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`ClampError`] | Error type shared by every engine crate |
//! | [`AbortFlag`] | Cooperative cancellation token polled by solvers |
//! | [`PassOutcome`] | Tagged result of a simulation pass |
//! | [`grid::Grid`] | Row × column matrix of per-condition parameters |
//! | [`expression`] | Named-variable arithmetic over time series |
//!
//! ## Conventions
//!
//! 1. Time is in seconds, rates are in 1/s
//! 2. Probability rows are ordered like the model's state names
//! 3. Every fallible operation returns [`Result`]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub mod expression;
pub mod grid;

pub use expression::{Expression, ExpressionError, Scope, Value};
pub use grid::{Grid, GridCell};

/// Common errors
#[derive(Debug, Error)]
pub enum ClampError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Model error: {0}")]
    ModelError(String),

    #[error("Expression error: {0}")]
    ExpressionError(#[from] ExpressionError),

    #[error("Numerical error: {0}")]
    NumericalError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClampError>;

/// Time point (s)
pub type Time = f64;

/// Transition rate (1/s)
pub type Rate = f64;

/// Stimulus values that hold during one epoch, keyed by stimulus name.
///
/// Compared by value: two epochs with equal snapshots share kinetics.
pub type StimulusSnapshot = BTreeMap<String, f64>;

/// Machine epsilon scaled for sample-time snapping.
pub const SNAP_EPSILON: f64 = f64::EPSILON * 5.0;

/// Shared cancellation flag.
///
/// Cloning yields a handle to the same flag, so a caller can keep one clone
/// and hand another to a background pass.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clear a previous request
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Result of a simulation or optimization pass that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassOutcome {
    /// All phases ran to completion
    Completed,
    /// The abort flag was raised; buffers written by the pass must not be used
    Aborted,
}

impl PassOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_flag_shared() {
        let flag = AbortFlag::new();
        let handle = flag.clone();
        assert!(!flag.is_aborted());

        handle.abort();
        assert!(flag.is_aborted());

        flag.reset();
        assert!(!handle.is_aborted());
    }

    #[test]
    fn test_error_from_expression() {
        let err: ClampError = ExpressionError::UnknownVariable("V".into()).into();
        assert!(err.to_string().contains("V"));
    }
}
