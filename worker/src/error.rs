use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("runtime rejected the request: {0}")]
    Rejected(String),

    #[error("unit {0} not found")]
    NotFound(String),

    #[error("runtime call timed out after {0:?}")]
    Timeout(Duration),

    #[error("runtime task panicked: {0}")]
    TaskPanicked(String),
}
