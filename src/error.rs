//! Error types for the segmentation pipeline

use thiserror::Error;

/// Why a scaler or model artifact could not be used
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    /// No artifact is stored under the requested name
    #[error("artifact '{0}' not found")]
    NotFound(String),

    /// The artifact exists but cannot be decoded or fails validation
    #[error("artifact '{name}' is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    /// The caller supplied no artifact at all
    #[error("{0} was not provided")]
    Missing(&'static str),
}

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Scaler or model missing or corrupt; no cluster-dependent output is produced
    #[error("Model unavailable: {0}")]
    ModelUnavailable(#[from] ArtifactError),

    /// One of the compared populations is empty
    #[error("Insufficient data for drift check: {0}")]
    InsufficientDataForDrift(String),

    /// Transaction store unreachable or write rejected
    #[error("Persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Baseline dataset could not be loaded
    #[error("Baseline error: {0}")]
    Baseline(String),

    /// Caller-supplied value rejected before touching any state
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV reading or column conversion failed
    #[error("Data frame error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    /// A store lock was poisoned by a panicking writer
    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
