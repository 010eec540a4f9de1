//! Error type for the detection core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The host handed over a buffer the core cannot segment.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The estimator refused a submission (for example its worker thread is gone).
    #[error("estimator: {0}")]
    Estimator(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
