//! Error taxonomy for the sampling engine.
//!
//! Numerical divergences are *not* errors: they are recorded on the
//! transition that produced them and the chain continues. Everything in
//! [`Error`] is fatal for the run that raised it.

use thiserror::Error;

/// Fatal engine errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid sampler configuration, detected before any iteration runs.
    #[error("configuration error: {0}")]
    Config(String),

    /// Mismatched parameter/vector dimensionality.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    Shape { expected: usize, got: usize },

    /// The model oracle itself failed (e.g. undefined log-density). Never
    /// retried: a failing oracle means an invalid model, not contention.
    #[error("model oracle error: {0}")]
    Oracle(String),

    /// Online statistics tracker failure (progress reporting only).
    #[error("statistics error: {0}")]
    Stats(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
