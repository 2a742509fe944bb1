//! Batch orchestration: at-most-one run per stage, durable resumable
//! progress, chunked fan-out of work units and consistent retry policy.

pub mod chunk;
pub mod control;
pub mod lock;
pub mod progress;
pub mod range;
pub mod retry;
pub mod runner;

pub use chunk::{plan_chunks, ChunkScheduler, ChunkSummary, Flow, GroupOutcome, UnitFailure};
pub use control::BatchControl;
pub use lock::LockManager;
pub use progress::{FinalizeOutcome, ProgressTracker};
pub use range::{parse_lookback, position_at_or_after, RangeRequest, UnitRange};
pub use retry::{
    classify_connectivity, classify_fault, classify_transaction, Delay, FaultKind, RetryError,
    RetryPolicy, Retried,
};
pub use runner::{BatchRunner, DeferReason, RunOutcome, RunReport, RunnerOptions};

/// A monotonic value (e.g. block height) used to order work and mark resumption.
pub trait Keyed {
    fn ordering_key(&self) -> i64;
}

impl Keyed for i64 {
    fn ordering_key(&self) -> i64 {
        *self
    }
}
