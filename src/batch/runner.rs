use std::{future::Future, sync::Arc, time::Duration, time::Instant};

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::{
    chunk::{plan_chunks, ChunkScheduler, ChunkSummary, Flow, GroupOutcome},
    lock::LockManager,
    progress::{FinalizeOutcome, ProgressTracker},
    range::{position_at_or_after, RangeRequest, UnitRange},
    retry::{classify_connectivity, classify_fault, classify_transaction, RetryError, RetryPolicy},
};
use crate::{
    error::{BatchError, BatchResult},
    metrics::BatchMetrics,
    models::{BatchLogEntry, BatchRecord, BatchStatus, LogLevel},
    repository::{BatchStore, LockClaim},
    traits::Stage,
};

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Sleep between two interval runs.
    pub interval: Duration,
    /// Minimum time between the end of one run and the start of the next.
    pub min_run_gap: Duration,
    /// Fixed chunk size; planned from `workers` when unset.
    pub chunk_size: Option<usize>,
    pub workers: usize,
    /// Chunks in flight at once.
    pub concurrency: usize,
    /// Cap on positions handled by one run.
    pub max_units: Option<usize>,
    pub unit_timeout: Option<Duration>,
    /// Fail the run once failed/attempted units exceed this ratio.
    pub max_unit_failure_ratio: Option<f64>,
    pub deadlock_retry: RetryPolicy,
    pub connectivity_retry: RetryPolicy,
    pub unit_retry: RetryPolicy,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            interval: Duration::from_secs(60),
            min_run_gap: Duration::ZERO,
            chunk_size: None,
            workers,
            concurrency: (workers / 2).max(1),
            max_units: Some(1_000),
            unit_timeout: Some(Duration::from_secs(5)),
            max_unit_failure_ratio: None,
            deadlock_retry: RetryPolicy::deadlock(),
            connectivity_retry: RetryPolicy::connectivity(),
            unit_retry: RetryPolicy::new(3, super::Delay::Linear(Duration::from_millis(500))),
        }
    }
}

/// Why an invocation returned without doing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// Another run holds a live lock on the stage.
    LockHeld,
    /// The stage has a paused batch waiting for an explicit resume.
    Paused,
    /// The previous run ended less than the minimum run gap ago.
    TooSoon,
}

impl DeferReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferReason::LockHeld => "lock_held",
            DeferReason::Paused => "paused",
            DeferReason::TooSoon => "too_soon",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub batch_id: i64,
    pub batch_key: Uuid,
    pub status: BatchStatus,
    /// Units persisted by this invocation.
    pub processed: usize,
    pub failed: usize,
    pub last_position: Option<i64>,
    pub target_position: Option<i64>,
    /// The final snapshot could not be written and waits on disk.
    pub spilled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Deferred(DeferReason),
    Finished(RunReport),
    /// Stopped between chunk groups because the record was paused, canceled
    /// or taken over.
    Halted(RunReport),
}

impl RunOutcome {
    pub fn processed(&self) -> usize {
        match self {
            RunOutcome::Deferred(_) => 0,
            RunOutcome::Finished(report) | RunOutcome::Halted(report) => report.processed,
        }
    }
}

enum Execution {
    Finished { summary: ChunkSummary, target: Option<i64> },
    Halted { summary: ChunkSummary, status: BatchStatus },
}

/// Drives one stage through the batch lifecycle: claim a record and its lock,
/// fan the work out in chunks, persist progress per chunk group, finalize.
pub struct BatchRunner<S: Stage> {
    stage: Arc<S>,
    store: Arc<dyn BatchStore>,
    locks: LockManager,
    progress: ProgressTracker,
    scheduler: ChunkScheduler,
    options: RunnerOptions,
    metrics: BatchMetrics,
}

impl<S: Stage> BatchRunner<S> {
    pub fn new(
        stage: Arc<S>,
        store: Arc<dyn BatchStore>,
        locks: LockManager,
        progress: ProgressTracker,
        options: RunnerOptions,
        metrics: BatchMetrics,
    ) -> Self {
        let scheduler = ChunkScheduler::new(options.unit_timeout);
        Self { stage, store, locks, progress, scheduler, options, metrics }
    }

    pub fn metrics(&self) -> &BatchMetrics {
        &self.metrics
    }

    /// Run the stage until a bounded request completes, or forever on the
    /// configured interval. Returns early only on errors that should stop
    /// the process.
    pub async fn run_loop(&self, request: RangeRequest) -> BatchResult<()> {
        let stage = self.stage.stage_type();
        loop {
            match self.run_once(&request).await {
                Ok(outcome) => {
                    tracing::info!(stage = %stage, processed = outcome.processed(), "Run finished: {:?}", outcome);
                }
                Err(err) if err.terminates_process() => {
                    tracing::error!(stage = %stage, error = %format!("{err:#}"), "Infrastructure unreachable, stopping");
                    return Err(err);
                }
                Err(err) => {
                    tracing::error!(stage = %stage, error = %format!("{err:#}"), "Run failed");
                    if request.is_bounded() {
                        return Err(err);
                    }
                }
            }

            if request.is_bounded() {
                return Ok(());
            }
            tokio::time::sleep(self.options.interval).await;
        }
    }

    /// One invocation. Deferral is not an error: it leaves every record untouched.
    pub async fn run_once(&self, request: &RangeRequest) -> BatchResult<RunOutcome> {
        let stage_type = self.stage.stage_type();
        self.reconcile().await?;

        let claim = if request.is_bounded() {
            LockClaim::New { batch_key: Uuid::new_v4(), stage_type }
        } else {
            let in_progress = self
                .with_store("Failed to load in-progress batch", || {
                    self.store.latest_non_terminal(stage_type)
                })
                .await?;
            match in_progress {
                Some(record) if record.status == BatchStatus::Paused => {
                    return Ok(self.defer(DeferReason::Paused));
                }
                // A live holder makes the acquire below defer; a crashed one is resumed.
                Some(record) => LockClaim::Resume { batch_key: record.batch_key },
                None => {
                    if self.too_soon().await? {
                        return Ok(self.defer(DeferReason::TooSoon));
                    }
                    LockClaim::New { batch_key: Uuid::new_v4(), stage_type }
                }
            }
        };

        self.run_claimed(claim, request, request.is_bounded()).await
    }

    /// Re-enter the latest paused (or crashed) batch of the stage and run it
    /// once from its last position up to its recorded target.
    pub async fn resume(&self) -> BatchResult<RunOutcome> {
        let stage_type = self.stage.stage_type();
        self.reconcile().await?;
        let record = self
            .with_store("Failed to load in-progress batch", || {
                self.store.latest_non_terminal(stage_type)
            })
            .await?
            .ok_or(BatchError::NothingToResume(stage_type))?;

        tracing::info!(stage = %stage_type, batch_id = record.id, status = %record.status, "Resuming batch");
        self.run_claimed(
            LockClaim::Resume { batch_key: record.batch_key },
            &RangeRequest::Incremental,
            true,
        )
        .await
    }

    /// Land final states spilled by earlier runs before any record is
    /// claimed, so a run that only failed to finalize is never resumed.
    async fn reconcile(&self) -> BatchResult<()> {
        let replayed = self
            .with_store("Failed to replay spilled snapshots", || self.progress.replay_spilled())
            .await?;
        if replayed > 0 {
            tracing::info!(stage = %self.stage.stage_type(), replayed, "Reconciled spilled batch snapshots");
        }
        Ok(())
    }

    async fn too_soon(&self) -> BatchResult<bool> {
        if self.options.min_run_gap.is_zero() {
            return Ok(false);
        }
        let gap = chrono::Duration::from_std(self.options.min_run_gap)
            .map_err(|err| BatchError::Other(err.into()))?;
        let stage_type = self.stage.stage_type();
        let last = self
            .with_store("Failed to load last finished batch", || self.store.latest_terminal(stage_type))
            .await?;
        Ok(last
            .and_then(|record| record.end_time)
            .map(|ended| ended + gap > Utc::now())
            .unwrap_or(false))
    }

    fn defer(&self, reason: DeferReason) -> RunOutcome {
        let stage = self.stage.stage_type();
        tracing::info!(stage = %stage, reason = reason.as_str(), "Deferring run");
        self.metrics.run_deferred(stage, reason.as_str());
        RunOutcome::Deferred(reason)
    }

    async fn run_claimed(
        &self,
        claim: LockClaim,
        request: &RangeRequest,
        bounded: bool,
    ) -> BatchResult<RunOutcome> {
        let stage_type = self.stage.stage_type();
        let resumed = matches!(claim, LockClaim::Resume { .. });

        let lock_key = self.stage.lock_key();
        let granted = self
            .with_store("Failed to acquire batch lock", || self.locks.acquire(&lock_key, claim.clone()))
            .await?;
        let Some(record) = granted else {
            return Ok(self.defer(DeferReason::LockHeld));
        };

        let started = Instant::now();
        self.metrics.run_started(stage_type);
        self.progress.track(
            record.batch_key,
            record.last_processed_position,
            record.processed_count,
            record.failed_count,
        )?;
        self.log(
            &record,
            LogLevel::Info,
            if resumed { "Batch resumed" } else { "Batch started" },
            Some(json!({
                "request": format!("{:?}", request),
                "last_processed_position": record.last_processed_position,
                "retry_count": record.retry_count,
            })),
        )
        .await;

        let execution = match self.execute(&record, request).await {
            Ok(execution) => execution,
            Err(err) => return Err(self.fail(&record, err, started).await),
        };

        match execution {
            Execution::Halted { summary, status } => {
                self.progress.forget(record.batch_key)?;
                if matches!(status, BatchStatus::Paused | BatchStatus::Canceled) {
                    if let Err(err) = self.locks.release(record.batch_key, true).await {
                        tracing::warn!(batch_key = %record.batch_key, error = ?err, "Failed to release lock");
                    }
                } else {
                    tracing::warn!(batch_key = %record.batch_key, status = %status, "Lock was taken over, stopping");
                }
                self.log(
                    &record,
                    LogLevel::Warn,
                    "Batch halted",
                    Some(json!({ "status": status, "last_position": summary.last_key })),
                )
                .await;
                Ok(RunOutcome::Halted(self.report(&record, status, &summary, None, false)))
            }
            Execution::Finished { summary, target } => {
                let status = if bounded { BatchStatus::Completed } else { BatchStatus::Success };
                let finalized = match self.progress.finalize(record.batch_key, status, None, 0).await {
                    Ok(finalized) => finalized,
                    Err(err) => {
                        let err = BatchError::Other(err.context("Failed to finalize batch"));
                        return Err(self.fail(&record, err, started).await);
                    }
                };
                if let Err(err) = self.locks.release(record.batch_key, true).await {
                    tracing::warn!(batch_key = %record.batch_key, error = ?err, "Failed to release lock");
                }

                if let FinalizeOutcome::Superseded(_) = finalized {
                    // Canceled between the last chunk group and finalize.
                    let status = self.current_status(record.batch_key).await?;
                    self.metrics.run_finished(stage_type, true, started.elapsed().as_secs_f64());
                    return Ok(RunOutcome::Halted(self.report(&record, status, &summary, target, false)));
                }

                let spilled = matches!(finalized, FinalizeOutcome::Spilled { .. });
                if spilled {
                    tracing::warn!(batch_key = %record.batch_key, "Batch finished in degraded mode, final state spilled to disk");
                }
                self.metrics.run_finished(stage_type, true, started.elapsed().as_secs_f64());
                self.log(
                    &record,
                    LogLevel::Info,
                    "Batch finished",
                    Some(json!({
                        "status": status,
                        "processed": summary.processed,
                        "failed": summary.failed,
                        "last_position": finalized.snapshot().last_processed_position,
                    })),
                )
                .await;

                let mut report = self.report(&record, status, &summary, target, spilled);
                report.last_position = finalized.snapshot().last_processed_position;
                Ok(RunOutcome::Finished(report))
            }
        }
    }

    async fn execute(&self, record: &BatchRecord, request: &RangeRequest) -> BatchResult<Execution> {
        let range = self.resolve_range(record, request).await?;
        if range.is_empty() {
            tracing::info!(stage = %record.stage_type, batch_key = %record.batch_key, "Nothing to process");
            return Ok(Execution::Finished { summary: ChunkSummary::default(), target: None });
        }
        self.with_store("Failed to record target position", || {
            self.store.set_target_position(record.batch_key, range.end)
        })
        .await?;

        let units = self
            .with_connectivity("Failed to fetch work units", || self.stage.fetch_units(range))
            .await?;

        if units.is_empty() {
            // Nothing exists in the window: move the cursor past it.
            tracing::info!(
                stage = %record.stage_type,
                batch_key = %record.batch_key,
                start = range.start,
                end = range.end,
                "No work units in range, skipping it"
            );
            let empty = GroupOutcome {
                results: Vec::new(),
                failures: Vec::new(),
                last_key: range.end,
                processed_total: 0,
                failed_total: 0,
            };
            let flow = self.persist_group(record, empty).await?;
            let summary = ChunkSummary {
                groups: 1,
                last_key: Some(range.end),
                halted: flow == Flow::Halt,
                ..ChunkSummary::default()
            };
            if summary.halted {
                let status = self.current_status(record.batch_key).await?;
                return Ok(Execution::Halted { summary, status });
            }
            return Ok(Execution::Finished { summary, target: Some(range.end) });
        }
        let chunk_size =
            self.options.chunk_size.unwrap_or_else(|| plan_chunks(units.len(), self.options.workers));

        tracing::info!(
            stage = %record.stage_type,
            batch_key = %record.batch_key,
            start = range.start,
            end = range.end,
            units = units.len(),
            chunk_size,
            "Processing work units"
        );

        let stage_type = record.stage_type;
        let summary = self
            .scheduler
            .run(
                units,
                chunk_size,
                self.options.concurrency,
                |unit: S::Unit| async move {
                    let retried = self
                        .options
                        .unit_retry
                        .run(classify_fault, || self.stage.process_unit(unit.clone()))
                        .await
                        .map_err(RetryError::into_inner)?;
                    self.metrics.record_retries(stage_type, retried.retries);
                    Ok::<_, anyhow::Error>(retried.value)
                },
                |group| self.persist_group(record, group),
            )
            .await?;

        if summary.halted {
            let status = self.current_status(record.batch_key).await?;
            return Ok(Execution::Halted { summary, status });
        }
        Ok(Execution::Finished { summary, target: Some(range.end) })
    }

    async fn resolve_range(&self, record: &BatchRecord, request: &RangeRequest) -> BatchResult<UnitRange> {
        let latest = self
            .with_connectivity("Failed to fetch latest position", || self.stage.latest_position())
            .await?;

        let range = match request {
            RangeRequest::Incremental => {
                let cursor = match record.last_processed_position {
                    Some(position) => Some(position),
                    None => {
                        let stage_type = record.stage_type;
                        self.with_store("Failed to load last position", || {
                            self.store.last_position(stage_type)
                        })
                        .await?
                    }
                };
                let earliest = self
                    .with_connectivity("Failed to fetch earliest position", || {
                        self.stage.earliest_position()
                    })
                    .await?;
                let end = record.target_position.unwrap_or(latest);
                UnitRange::new(earliest, end).after(cursor).capped(self.options.max_units)
            }
            RangeRequest::Explicit { start, end } => {
                UnitRange::new(*start, (*end).min(latest)).after(record.last_processed_position)
            }
            RangeRequest::Lookback(window) => {
                let target_ms = Utc::now().timestamp_millis() - window.as_millis() as i64;
                let earliest = self
                    .with_connectivity("Failed to fetch earliest position", || {
                        self.stage.earliest_position()
                    })
                    .await?;
                let start = self
                    .with_connectivity("Failed to map lookback to a position", || {
                        position_at_or_after(target_ms, earliest, latest, move |position| {
                            self.stage.timestamp_at(position)
                        })
                    })
                    .await?;
                match start {
                    Some(start) => UnitRange::new(start, latest),
                    None => UnitRange::new(latest + 1, latest),
                }
                .after(record.last_processed_position)
            }
        };
        Ok(range)
    }

    /// Save one chunk group, then advance progress. Runs before the next
    /// group is dispatched.
    async fn persist_group(
        &self,
        record: &BatchRecord,
        group: GroupOutcome<S::Output>,
    ) -> BatchResult<Flow> {
        if !group.results.is_empty() {
            let saved = self
                .options
                .deadlock_retry
                .run(classify_fault, || self.stage.save_batch(&group.results))
                .await
                .map_err(|err| err.into_inner().context("Failed to save chunk group"))?;
            self.metrics.record_retries(record.stage_type, saved.retries);
        }

        let ack = self
            .with_store("Failed to record progress", || {
                self.progress.record_progress(
                    record.batch_key,
                    group.last_key,
                    group.results.len() as i64,
                    group.failures.len() as i64,
                )
            })
            .await?;
        self.metrics.record_group(
            record.stage_type,
            group.results.len(),
            group.failures.len(),
            group.last_key,
        );

        let level = if group.failures.is_empty() { LogLevel::Info } else { LogLevel::Warn };
        self.log(
            record,
            level,
            "Chunk group persisted",
            Some(json!({
                "position": group.last_key,
                "processed": group.results.len(),
                "failed": group.failures.len(),
                "failed_keys": group.failures.iter().map(|f| f.key).collect::<Vec<_>>(),
                "errors": group.failures.iter().map(|f| f.error.as_str()).collect::<Vec<_>>(),
            })),
        )
        .await;

        if ack.status != BatchStatus::Running {
            tracing::info!(
                batch_key = %record.batch_key,
                status = %ack.status,
                "Batch no longer running, halting after chunk group"
            );
            return Ok(Flow::Halt);
        }

        if let Some(max_ratio) = self.options.max_unit_failure_ratio {
            let attempted = group.processed_total + group.failed_total;
            if attempted > 0 && group.failed_total as f64 / attempted as f64 > max_ratio {
                return Err(BatchError::TooManyUnitFailures {
                    failed: group.failed_total,
                    attempted,
                    max_ratio,
                });
            }
        }
        Ok(Flow::Continue)
    }

    /// Mark the run FAILED, release its lock as failed, and hand the error back.
    async fn fail(&self, record: &BatchRecord, err: BatchError, started: Instant) -> BatchError {
        let detail = format!("{err:#}");
        tracing::error!(
            stage = %record.stage_type,
            batch_key = %record.batch_key,
            error = %detail,
            "Batch failed"
        );
        self.log(record, LogLevel::Error, "Batch failed", Some(json!({ "error": detail }))).await;

        if let Err(finalize_err) =
            self.progress.finalize(record.batch_key, BatchStatus::Failed, Some(detail), 1).await
        {
            tracing::warn!(batch_key = %record.batch_key, error = ?finalize_err, "Failed to record batch failure");
        }
        if let Err(release_err) = self.locks.release(record.batch_key, false).await {
            tracing::warn!(batch_key = %record.batch_key, error = ?release_err, "Failed to release lock");
        }
        self.metrics.run_finished(record.stage_type, false, started.elapsed().as_secs_f64());
        err
    }

    async fn with_connectivity<T, F, Fut>(&self, what: &'static str, operation: F) -> BatchResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match self.options.connectivity_retry.run(classify_connectivity, operation).await {
            Ok(retried) => {
                self.metrics.record_retries(self.stage.stage_type(), retried.retries);
                Ok(retried.value)
            }
            Err(RetryError::Exhausted { attempts, last_error }) => {
                Err(BatchError::ConnectivityExhausted { attempts, last_error: last_error.context(what) })
            }
            Err(RetryError::Fatal(err)) => Err(BatchError::Other(err.context(what))),
        }
    }

    /// Store call with transaction conflicts retried under the deadlock
    /// policy and lost connections under the connectivity policy.
    async fn with_store<T, F, Fut>(&self, what: &'static str, operation: F) -> BatchResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let operation = &operation;
        self.with_connectivity(what, || async move {
            let retried = self
                .options
                .deadlock_retry
                .run(classify_transaction, operation)
                .await
                .map_err(RetryError::into_inner)?;
            self.metrics.record_retries(self.stage.stage_type(), retried.retries);
            Ok(retried.value)
        })
        .await
    }

    async fn current_status(&self, batch_key: Uuid) -> BatchResult<BatchStatus> {
        let current = self
            .with_store("Failed to load batch status", || self.store.find_by_key(batch_key))
            .await?;
        Ok(current.map(|record| record.status).unwrap_or(BatchStatus::Failed))
    }

    async fn log(
        &self,
        record: &BatchRecord,
        level: LogLevel,
        message: &str,
        detail: Option<serde_json::Value>,
    ) {
        let mut entry = BatchLogEntry::new(level, message);
        if let Some(detail) = detail {
            entry = entry.with_detail(detail);
        }
        if let Err(err) = self.store.append_log(record.batch_key, &entry).await {
            tracing::warn!(batch_key = %record.batch_key, error = ?err, "Failed to append batch log");
        }
    }

    fn report(
        &self,
        record: &BatchRecord,
        status: BatchStatus,
        summary: &ChunkSummary,
        target: Option<i64>,
        spilled: bool,
    ) -> RunReport {
        RunReport {
            batch_id: record.id,
            batch_key: record.batch_key,
            status,
            processed: summary.processed,
            failed: summary.failed,
            last_position: summary.last_key.or(record.last_processed_position),
            target_position: target.or(record.target_position),
            spilled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch::{BatchControl, Delay},
        models::{LockStatus, StageType},
        repository::{BatchSnapshot, InMemoryBatchStore, LockRequest, ProgressAck, ProgressDelta},
    };
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Mutex,
        },
    };
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct FakeStage {
        latest: i64,
        failing_units: HashSet<i64>,
        saved: Mutex<Vec<i64>>,
        /// Save never returns once a group reaches this key, like a process that died mid-write.
        hang_from: Option<i64>,
        /// Pause the running batch through this store on the first save.
        pause_via: Option<Arc<InMemoryBatchStore>>,
        paused: AtomicBool,
        unreachable: bool,
        latest_calls: AtomicU32,
        /// Unix ms of position 0; one position per minute after it.
        genesis_ms: i64,
        /// Nothing exists below this position.
        earliest: i64,
        /// Inclusive span of positions with no work unit.
        gap: Option<(i64, i64)>,
        /// Save fails for good once a group reaches this key.
        fail_save_from: Option<i64>,
    }

    impl FakeStage {
        fn with_latest(latest: i64) -> Self {
            Self { latest, ..Self::default() }
        }

        fn saved(&self) -> Vec<i64> {
            self.saved.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Stage for FakeStage {
        type Unit = i64;
        type Output = i64;

        fn stage_type(&self) -> StageType {
            StageType::Extract
        }

        async fn latest_position(&self) -> Result<i64> {
            self.latest_calls.fetch_add(1, Ordering::SeqCst);
            if self.unreachable {
                return Err(anyhow!("connection refused"));
            }
            Ok(self.latest)
        }

        async fn earliest_position(&self) -> Result<i64> {
            Ok(self.earliest)
        }

        async fn fetch_units(&self, range: UnitRange) -> Result<Vec<i64>> {
            let missing = |position: &i64| {
                self.gap.map(|(from, to)| (from..=to).contains(position)).unwrap_or(false)
            };
            Ok(range
                .positions()
                .filter(|position| *position >= self.earliest && !missing(position))
                .collect())
        }

        async fn process_unit(&self, unit: i64) -> Result<i64> {
            if self.failing_units.contains(&unit) {
                return Err(anyhow!("unit {} is corrupt", unit));
            }
            Ok(unit)
        }

        async fn save_batch(&self, outputs: &[i64]) -> Result<()> {
            if let Some(fail_from) = self.fail_save_from {
                if outputs.iter().any(|key| *key >= fail_from) {
                    return Err(anyhow!("constraint violation on key {}", fail_from));
                }
            }
            if let Some(hang_from) = self.hang_from {
                if outputs.iter().any(|key| *key >= hang_from) {
                    std::future::pending::<()>().await;
                }
            }
            self.saved.lock().unwrap().extend_from_slice(outputs);

            if let Some(store) = &self.pause_via {
                if !self.paused.swap(true, Ordering::SeqCst) {
                    let running = store.latest_non_terminal(StageType::Extract).await?.unwrap();
                    BatchControl::new(store.clone()).pause(running.id).await?;
                }
            }
            Ok(())
        }

        async fn timestamp_at(&self, position: i64) -> Result<i64> {
            Ok(self.genesis_ms + position * 60_000)
        }
    }

    fn options() -> RunnerOptions {
        RunnerOptions {
            interval: Duration::from_millis(1),
            min_run_gap: Duration::ZERO,
            chunk_size: Some(10),
            workers: 2,
            concurrency: 1,
            max_units: None,
            unit_timeout: Some(Duration::from_secs(1)),
            max_unit_failure_ratio: None,
            deadlock_retry: RetryPolicy::new(2, Delay::Fixed(Duration::from_millis(1))),
            connectivity_retry: RetryPolicy::new(3, Delay::Fixed(Duration::from_millis(1))),
            unit_retry: RetryPolicy::none(),
        }
    }

    fn runner(
        stage: Arc<FakeStage>,
        store: Arc<dyn BatchStore>,
        options: RunnerOptions,
    ) -> (BatchRunner<FakeStage>, TempDir) {
        let dir = tempdir().unwrap();
        let runner = runner_in(stage, store, options, dir.path());
        (runner, dir)
    }

    fn runner_in(
        stage: Arc<FakeStage>,
        store: Arc<dyn BatchStore>,
        options: RunnerOptions,
        snapshot_dir: &std::path::Path,
    ) -> BatchRunner<FakeStage> {
        let locks = LockManager::new(store.clone(), Duration::from_secs(60));
        let progress = ProgressTracker::new(store.clone(), snapshot_dir);
        BatchRunner::new(stage, store, locks, progress, options, BatchMetrics::new())
    }

    /// Fails the first calls of `acquire_lock` with a deadlock and of
    /// `record_progress` with a dropped connection, then delegates.
    struct FlakyStore {
        inner: Arc<InMemoryBatchStore>,
        acquire_failures: AtomicU32,
        progress_failures: AtomicU32,
    }

    impl FlakyStore {
        fn new(inner: Arc<InMemoryBatchStore>, acquire_failures: u32, progress_failures: u32) -> Self {
            Self {
                inner,
                acquire_failures: AtomicU32::new(acquire_failures),
                progress_failures: AtomicU32::new(progress_failures),
            }
        }
    }

    fn take(budget: &AtomicU32) -> bool {
        budget.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }

    fn connection_reset() -> anyhow::Error {
        anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
    }

    #[async_trait]
    impl BatchStore for FlakyStore {
        async fn acquire_lock(
            &self,
            request: &LockRequest,
            now: chrono::DateTime<Utc>,
        ) -> Result<Option<BatchRecord>> {
            if take(&self.acquire_failures) {
                return Err(anyhow!("ERROR: deadlock detected"));
            }
            self.inner.acquire_lock(request, now).await
        }

        async fn release_lock(
            &self,
            batch_key: Uuid,
            lock_status: LockStatus,
            now: chrono::DateTime<Utc>,
        ) -> Result<()> {
            self.inner.release_lock(batch_key, lock_status, now).await
        }

        async fn record_progress(
            &self,
            batch_key: Uuid,
            delta: &ProgressDelta,
            now: chrono::DateTime<Utc>,
        ) -> Result<ProgressAck> {
            if take(&self.progress_failures) {
                return Err(connection_reset());
            }
            self.inner.record_progress(batch_key, delta, now).await
        }

        async fn set_target_position(&self, batch_key: Uuid, target: i64) -> Result<()> {
            self.inner.set_target_position(batch_key, target).await
        }

        async fn finalize(&self, snapshot: &BatchSnapshot) -> Result<bool> {
            self.inner.finalize(snapshot).await
        }

        async fn transition(
            &self,
            id: i64,
            from: &[BatchStatus],
            to: BatchStatus,
            now: chrono::DateTime<Utc>,
        ) -> Result<Option<BatchRecord>> {
            self.inner.transition(id, from, to, now).await
        }

        async fn append_log(&self, batch_key: Uuid, entry: &BatchLogEntry) -> Result<()> {
            self.inner.append_log(batch_key, entry).await
        }

        async fn find_by_id(&self, id: i64) -> Result<Option<BatchRecord>> {
            self.inner.find_by_id(id).await
        }

        async fn find_by_key(&self, batch_key: Uuid) -> Result<Option<BatchRecord>> {
            self.inner.find_by_key(batch_key).await
        }

        async fn latest(&self, stage_type: StageType) -> Result<Option<BatchRecord>> {
            self.inner.latest(stage_type).await
        }

        async fn latest_terminal(&self, stage_type: StageType) -> Result<Option<BatchRecord>> {
            self.inner.latest_terminal(stage_type).await
        }

        async fn latest_non_terminal(&self, stage_type: StageType) -> Result<Option<BatchRecord>> {
            self.inner.latest_non_terminal(stage_type).await
        }

        async fn last_position(&self, stage_type: StageType) -> Result<Option<i64>> {
            self.inner.last_position(stage_type).await
        }
    }

    fn finished(outcome: RunOutcome) -> RunReport {
        match outcome {
            RunOutcome::Finished(report) => report,
            other => panic!("expected finished run, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_incremental_run_processes_everything_and_succeeds() {
        let store = Arc::new(InMemoryBatchStore::new());
        let stage = Arc::new(FakeStage::with_latest(24));
        let (runner, _dir) = runner(stage.clone(), store.clone(), options());

        let report = finished(runner.run_once(&RangeRequest::Incremental).await.unwrap());

        assert_eq!(report.status, BatchStatus::Success);
        assert_eq!(report.processed, 25);
        assert_eq!(stage.saved(), (0..=24).collect::<Vec<_>>());

        let record = store.find_by_key(report.batch_key).await.unwrap().unwrap();
        assert_eq!(record.status, BatchStatus::Success);
        assert_eq!(record.lock_status, LockStatus::Unlocked);
        assert_eq!(record.last_processed_position, Some(24));
        assert_eq!(record.target_position, Some(24));
        assert_eq!(record.processed_count, 25);
        assert!(record.end_time.is_some());
        assert!(record.logs.iter().any(|entry| entry.message == "Batch finished"));
    }

    #[tokio::test]
    async fn test_next_run_starts_after_last_position() {
        let store = Arc::new(InMemoryBatchStore::new());
        let stage = Arc::new(FakeStage::with_latest(9));
        let (first, _dir) = runner(stage.clone(), store.clone(), options());
        first.run_once(&RangeRequest::Incremental).await.unwrap();

        let stage = Arc::new(FakeStage::with_latest(14));
        let (second, _dir) = runner(stage.clone(), store.clone(), options());
        let report = finished(second.run_once(&RangeRequest::Incremental).await.unwrap());

        assert_eq!(stage.saved(), (10..=14).collect::<Vec<_>>());
        assert_eq!(report.processed, 5);
    }

    #[tokio::test]
    async fn test_live_lock_defers_without_state_change() {
        let store = Arc::new(InMemoryBatchStore::new());
        let stage = Arc::new(FakeStage::with_latest(5));
        let (runner, _dir) = runner(stage.clone(), store.clone(), options());

        let holder = LockManager::new(store.clone(), Duration::from_secs(60));
        holder
            .acquire(
                &StageType::Extract.lock_key(),
                LockClaim::New { batch_key: Uuid::new_v4(), stage_type: StageType::Extract },
            )
            .await
            .unwrap()
            .unwrap();

        let outcome = runner.run_once(&RangeRequest::Explicit { start: 0, end: 5 }).await.unwrap();
        assert_eq!(outcome, RunOutcome::Deferred(DeferReason::LockHeld));
        assert_eq!(outcome.processed(), 0);
        assert_eq!(store.records().unwrap().len(), 1);
        assert!(stage.saved().is_empty());
    }

    #[tokio::test]
    async fn test_partial_failures_are_counted_not_fatal() {
        let store = Arc::new(InMemoryBatchStore::new());
        let stage = Arc::new(FakeStage {
            latest: 9,
            failing_units: HashSet::from([3]),
            ..FakeStage::default()
        });
        let mut opts = options();
        opts.chunk_size = Some(5);
        let (runner, _dir) = runner(stage.clone(), store.clone(), opts);

        let report = finished(runner.run_once(&RangeRequest::Incremental).await.unwrap());

        assert_eq!(report.processed, 9);
        assert_eq!(report.failed, 1);
        assert_eq!(stage.saved(), vec![0, 1, 2, 4, 5, 6, 7, 8, 9]);
        let record = store.find_by_key(report.batch_key).await.unwrap().unwrap();
        assert_eq!(record.failed_count, 1);
        assert_eq!(record.status, BatchStatus::Success);
    }

    #[tokio::test]
    async fn test_failure_ratio_fails_the_run() {
        let store = Arc::new(InMemoryBatchStore::new());
        let stage = Arc::new(FakeStage {
            latest: 9,
            failing_units: HashSet::from([0, 1, 2, 3]),
            ..FakeStage::default()
        });
        let mut opts = options();
        opts.max_unit_failure_ratio = Some(0.25);
        let (runner, _dir) = runner(stage.clone(), store.clone(), opts);

        let err = runner.run_once(&RangeRequest::Incremental).await.unwrap_err();
        assert!(matches!(err, BatchError::TooManyUnitFailures { failed: 4, attempted: 10, .. }));
        assert!(!err.terminates_process());

        let record = &store.records().unwrap()[0];
        assert_eq!(record.status, BatchStatus::Failed);
        assert_eq!(record.lock_status, LockStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record.error_detail.as_deref().unwrap().contains("4 of 10"));
    }

    #[tokio::test]
    async fn test_connectivity_exhaustion_terminates() {
        let store = Arc::new(InMemoryBatchStore::new());
        let stage = Arc::new(FakeStage { unreachable: true, ..FakeStage::default() });
        let (runner, _dir) = runner(stage.clone(), store.clone(), options());

        let err = runner.run_loop(RangeRequest::Incremental).await.unwrap_err();

        assert!(err.terminates_process());
        assert!(matches!(err, BatchError::ConnectivityExhausted { attempts: 3, .. }));
        assert_eq!(stage.latest_calls.load(Ordering::SeqCst), 3);
        let record = &store.records().unwrap()[0];
        assert_eq!(record.status, BatchStatus::Failed);
        assert!(record.error_detail.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_crash_then_resume_never_reprocesses() {
        let store = Arc::new(InMemoryBatchStore::new());
        let crashing = Arc::new(FakeStage { latest: 99, hang_from: Some(50), ..FakeStage::default() });
        let (first, _dir) = runner(crashing.clone(), store.clone(), options());

        // Dropping the future mid-save leaves the record RUNNING and LOCKED.
        let crashed =
            tokio::time::timeout(Duration::from_millis(200), first.run_once(&RangeRequest::Incremental))
                .await;
        assert!(crashed.is_err());

        let record = store.records().unwrap()[0].clone();
        assert_eq!(record.status, BatchStatus::Running);
        assert_eq!(record.last_processed_position, Some(49));

        // Within the lease the crashed holder still blocks.
        let healthy = Arc::new(FakeStage::with_latest(99));
        let (second, _dir) = runner(healthy.clone(), store.clone(), options());
        assert_eq!(
            second.run_once(&RangeRequest::Incremental).await.unwrap(),
            RunOutcome::Deferred(DeferReason::LockHeld)
        );

        store
            .set_lock_time(record.batch_key, Utc::now() - chrono::Duration::seconds(61))
            .unwrap();
        let report = finished(second.run_once(&RangeRequest::Incremental).await.unwrap());

        assert_eq!(report.batch_key, record.batch_key);
        let mut all = crashing.saved();
        all.extend(healthy.saved());
        assert_eq!(all, (0..=99).collect::<Vec<_>>());

        let record = store.find_by_key(record.batch_key).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.processed_count, 100);
        assert_eq!(record.status, BatchStatus::Success);
    }

    #[tokio::test]
    async fn test_pause_halts_then_resume_completes() {
        let store = Arc::new(InMemoryBatchStore::new());
        let stage = Arc::new(FakeStage {
            latest: 29,
            pause_via: Some(store.clone()),
            ..FakeStage::default()
        });
        let (runner, _dir) = runner(stage.clone(), store.clone(), options());

        let outcome = runner.run_once(&RangeRequest::Incremental).await.unwrap();
        let RunOutcome::Halted(report) = outcome else {
            panic!("expected halted run, got {:?}", outcome);
        };
        assert_eq!(report.status, BatchStatus::Paused);
        assert_eq!(stage.saved(), (0..=9).collect::<Vec<_>>());

        let record = store.find_by_key(report.batch_key).await.unwrap().unwrap();
        assert_eq!(record.status, BatchStatus::Paused);
        assert_eq!(record.lock_status, LockStatus::Unlocked);
        assert!(record.end_time.is_none());

        assert_eq!(
            runner.run_once(&RangeRequest::Incremental).await.unwrap(),
            RunOutcome::Deferred(DeferReason::Paused)
        );

        let resumed = finished(runner.resume().await.unwrap());
        assert_eq!(resumed.batch_key, report.batch_key);
        assert_eq!(resumed.status, BatchStatus::Completed);
        assert_eq!(stage.saved(), (0..=29).collect::<Vec<_>>());

        let record = store.find_by_key(report.batch_key).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.processed_count, 30);
    }

    #[tokio::test]
    async fn test_resume_without_candidate_fails_clearly() {
        let store = Arc::new(InMemoryBatchStore::new());
        let (runner, _dir) = runner(Arc::new(FakeStage::with_latest(3)), store, options());

        let err = runner.resume().await.unwrap_err();
        assert!(matches!(err, BatchError::NothingToResume(StageType::Extract)));
    }

    #[tokio::test]
    async fn test_min_run_gap_defers_interval_runs() {
        let store = Arc::new(InMemoryBatchStore::new());
        let stage = Arc::new(FakeStage::with_latest(3));
        let mut opts = options();
        opts.min_run_gap = Duration::from_secs(3600);
        let (runner, _dir) = runner(stage.clone(), store.clone(), opts);

        finished(runner.run_once(&RangeRequest::Incremental).await.unwrap());
        assert_eq!(
            runner.run_once(&RangeRequest::Incremental).await.unwrap(),
            RunOutcome::Deferred(DeferReason::TooSoon)
        );
        // Bounded runs are explicit requests and ignore the gap.
        let report = finished(runner.run_once(&RangeRequest::Explicit { start: 0, end: 1 }).await.unwrap());
        assert_eq!(report.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_explicit_range_is_clamped_to_latest() {
        let store = Arc::new(InMemoryBatchStore::new());
        let stage = Arc::new(FakeStage::with_latest(12));
        let (runner, _dir) = runner(stage.clone(), store.clone(), options());

        runner.run_loop(RangeRequest::Explicit { start: 5, end: 500 }).await.unwrap();

        assert_eq!(stage.saved(), (5..=12).collect::<Vec<_>>());
        let record = &store.records().unwrap()[0];
        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.target_position, Some(12));
    }

    #[tokio::test]
    async fn test_lookback_selects_recent_positions() {
        let store = Arc::new(InMemoryBatchStore::new());
        let latest = 999;
        // Position 999 is stamped 30s in the future, so the two-hour window
        // starts at 879 regardless of how long the test takes to get there.
        let genesis_ms = Utc::now().timestamp_millis() - latest * 60_000 + 30_000;
        let stage = Arc::new(FakeStage { latest, genesis_ms, ..FakeStage::default() });
        let (runner, _dir) = runner(stage.clone(), store.clone(), options());

        let report = finished(
            runner.run_once(&RangeRequest::Lookback(Duration::from_millis(7_200_000))).await.unwrap(),
        );

        let saved = stage.saved();
        assert_eq!(saved.first(), Some(&879));
        assert_eq!(saved.last(), Some(&999));
        assert_eq!(report.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_spilled_finalize_still_finishes() {
        let store = Arc::new(InMemoryBatchStore::new());
        let stage = Arc::new(FakeStage::with_latest(4));
        let (runner, _dir) = runner(stage.clone(), store.clone(), options());
        store.fail_finalize(true);

        let report = finished(runner.run_once(&RangeRequest::Incremental).await.unwrap());
        assert!(report.spilled);
        assert_eq!(report.last_position, Some(4));
    }

    #[tokio::test]
    async fn test_incremental_run_starts_at_earliest_position() {
        let store = Arc::new(InMemoryBatchStore::new());
        let stage = Arc::new(FakeStage { latest: 5_999, earliest: 5_000, ..FakeStage::default() });
        let mut opts = options();
        opts.max_units = Some(400);
        let (runner, _dir) = runner(stage.clone(), store.clone(), opts);

        for _ in 0..3 {
            finished(runner.run_once(&RangeRequest::Incremental).await.unwrap());
        }

        assert_eq!(stage.saved(), (5_000..=5_999).collect::<Vec<_>>());
        assert_eq!(store.last_position(StageType::Extract).await.unwrap(), Some(5_999));
    }

    #[tokio::test]
    async fn test_incremental_run_moves_past_gap_wider_than_a_run() {
        let store = Arc::new(InMemoryBatchStore::new());
        let stage = Arc::new(FakeStage { latest: 99, gap: Some((10, 59)), ..FakeStage::default() });
        let mut opts = options();
        opts.max_units = Some(20);
        let (runner, _dir) = runner(stage.clone(), store.clone(), opts);

        let mut positions = Vec::new();
        for _ in 0..6 {
            let report = finished(runner.run_once(&RangeRequest::Incremental).await.unwrap());
            positions.push(report.last_position);
        }

        assert_eq!(positions, vec![Some(9), Some(29), Some(49), Some(69), Some(89), Some(99)]);
        let expected: Vec<i64> = (0..=9).chain(60..=99).collect();
        assert_eq!(stage.saved(), expected);
    }

    #[tokio::test]
    async fn test_spilled_failure_is_reconciled_before_next_run() {
        let store = Arc::new(InMemoryBatchStore::new());
        let dir = tempdir().unwrap();
        let failing = Arc::new(FakeStage { latest: 29, fail_save_from: Some(10), ..FakeStage::default() });
        let first = runner_in(failing.clone(), store.clone(), options(), dir.path());

        store.fail_finalize(true);
        assert!(first.run_once(&RangeRequest::Incremental).await.is_err());
        store.fail_finalize(false);

        let crashed = store.records().unwrap()[0].clone();
        assert_eq!(crashed.status, BatchStatus::Running);
        assert_eq!(crashed.lock_status, LockStatus::Failed);

        let healthy = Arc::new(FakeStage::with_latest(29));
        let second = runner_in(healthy.clone(), store.clone(), options(), dir.path());
        let report = finished(second.run_once(&RangeRequest::Incremental).await.unwrap());
        assert_ne!(report.batch_key, crashed.batch_key);

        // A later reconcile has nothing left to rewind.
        assert_eq!(second.progress.replay_spilled().await.unwrap(), 0);
        let report = finished(second.run_once(&RangeRequest::Incremental).await.unwrap());
        assert_eq!(report.processed, 0);

        let mut all = failing.saved();
        all.extend(healthy.saved());
        assert_eq!(all, (0..=29).collect::<Vec<_>>());

        let crashed = store.find_by_key(crashed.batch_key).await.unwrap().unwrap();
        assert_eq!(crashed.status, BatchStatus::Failed);
        assert_eq!(crashed.last_processed_position, Some(9));
        assert_eq!(crashed.retry_count, 1);
        let records = store.records().unwrap();
        assert_eq!(records[1].status, BatchStatus::Success);
        assert_eq!(records[1].last_processed_position, Some(29));
        assert_eq!(records[1].processed_count, 20);
    }

    #[tokio::test]
    async fn test_transient_store_faults_are_retried_in_place() {
        let inner = Arc::new(InMemoryBatchStore::new());
        let store = Arc::new(FlakyStore::new(inner.clone(), 1, 2));
        let stage = Arc::new(FakeStage::with_latest(9));
        let (runner, _dir) = runner(stage.clone(), store, options());

        let report = finished(runner.run_once(&RangeRequest::Incremental).await.unwrap());

        assert_eq!(report.status, BatchStatus::Success);
        assert_eq!(stage.saved(), (0..=9).collect::<Vec<_>>());
        let record = inner.find_by_key(report.batch_key).await.unwrap().unwrap();
        assert_eq!(record.last_processed_position, Some(9));
        assert_eq!(record.processed_count, 10);
    }

    #[tokio::test]
    async fn test_database_lost_mid_run_terminates() {
        let inner = Arc::new(InMemoryBatchStore::new());
        let store = Arc::new(FlakyStore::new(inner.clone(), 0, u32::MAX));
        let (runner, _dir) = runner(Arc::new(FakeStage::with_latest(9)), store, options());

        let err = runner.run_loop(RangeRequest::Incremental).await.unwrap_err();

        assert!(err.terminates_process());
        assert!(matches!(err, BatchError::ConnectivityExhausted { attempts: 3, .. }));
        let record = &inner.records().unwrap()[0];
        assert_eq!(record.status, BatchStatus::Failed);
        assert_eq!(record.lock_status, LockStatus::Failed);
    }

    #[tokio::test]
    async fn test_exhausted_deadlock_retries_fail_without_terminating() {
        let inner = Arc::new(InMemoryBatchStore::new());
        let store = Arc::new(FlakyStore::new(inner.clone(), 2, 0));
        let (runner, _dir) = runner(Arc::new(FakeStage::with_latest(9)), store, options());

        let err = runner.run_once(&RangeRequest::Incremental).await.unwrap_err();

        assert!(!err.terminates_process());
        assert!(format!("{err:#}").contains("deadlock detected"));
        assert!(inner.records().unwrap().is_empty());
    }
}
