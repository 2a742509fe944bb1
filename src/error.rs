use crate::models::{BatchStatus, StageType};

/// Batch-level failures surfaced to the interval loop.
///
/// Unit failures never show up here: they are counted on the record and
/// absorbed by the chunk scheduler.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// The chain or database stayed unreachable through every connectivity retry.
    #[error("connectivity lost after {attempts} attempts: {last_error:#}")]
    ConnectivityExhausted { attempts: u32, last_error: anyhow::Error },

    #[error("{failed} of {attempted} work units failed, above the tolerated ratio {max_ratio}")]
    TooManyUnitFailures { failed: usize, attempted: usize, max_ratio: f64 },

    #[error("batch {0} not found")]
    NotFound(String),

    #[error("batch {id} is {status}, expected {expected}")]
    InvalidTransition { id: i64, status: BatchStatus, expected: &'static str },

    #[error("no resumable batch for stage {0}")]
    NothingToResume(StageType),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BatchError {
    /// Infrastructure is down: stop looping and let the supervisor restart us.
    pub fn terminates_process(&self) -> bool {
        matches!(self, BatchError::ConnectivityExhausted { .. })
    }
}

pub type BatchResult<T> = std::result::Result<T, BatchError>;
