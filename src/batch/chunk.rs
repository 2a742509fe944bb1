use std::{future::Future, time::Duration};

use futures::future::join_all;

use super::Keyed;

/// Chunk size that spreads `total_units` over half of the available workers,
/// leaving the other half of the host's parallelism alone.
pub fn plan_chunks(total_units: usize, available_workers: usize) -> usize {
    let lanes = (available_workers / 2).max(1);
    total_units.div_ceil(lanes).max(1)
}

/// Whether the scheduler should start the next chunk group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub key: i64,
    pub error: String,
}

/// Result of one group of up to `concurrency` chunks, handed to the caller to
/// persist before the next group starts.
#[derive(Debug)]
pub struct GroupOutcome<R> {
    /// Successful results, sorted by ordering key.
    pub results: Vec<R>,
    pub failures: Vec<UnitFailure>,
    /// Highest ordering key dispatched in this group, failed units included.
    pub last_key: i64,
    /// Running totals across all groups so far, this one included.
    pub processed_total: usize,
    pub failed_total: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkSummary {
    pub processed: usize,
    pub failed: usize,
    pub groups: usize,
    pub last_key: Option<i64>,
    /// Set when the group callback asked to stop before all units were dispatched.
    pub halted: bool,
}

/// Splits ordered work into contiguous chunks and drives them with bounded
/// parallelism.
#[derive(Debug, Clone, Default)]
pub struct ChunkScheduler {
    unit_timeout: Option<Duration>,
}

impl ChunkScheduler {
    pub fn new(unit_timeout: Option<Duration>) -> Self {
        Self { unit_timeout }
    }

    /// Process `units` in chunks of `chunk_size`, `concurrency` chunks at a
    /// time. Every unit of a chunk is in flight at once; a failed or timed out
    /// unit is counted and skipped without affecting its siblings.
    ///
    /// After each group, `on_group` receives the sorted successes. It runs to
    /// completion before the next group is dispatched, which makes the group
    /// the durability boundary. An error from `on_group` aborts the run.
    pub async fn run<U, R, E, H, HFut, G, GFut>(
        &self,
        units: Vec<U>,
        chunk_size: usize,
        concurrency: usize,
        handler: H,
        mut on_group: G,
    ) -> Result<ChunkSummary, E>
    where
        U: Keyed,
        R: Keyed,
        H: Fn(U) -> HFut,
        HFut: Future<Output = anyhow::Result<R>>,
        G: FnMut(GroupOutcome<R>) -> GFut,
        GFut: Future<Output = Result<Flow, E>>,
    {
        let chunk_size = chunk_size.max(1);
        let concurrency = concurrency.max(1);
        let mut chunks = partition(units, chunk_size);
        let mut summary = ChunkSummary::default();

        while !chunks.is_empty() {
            let rest = chunks.split_off(concurrency.min(chunks.len()));
            let group = std::mem::replace(&mut chunks, rest);

            tracing::debug!(
                chunks = group.len(),
                units = group.iter().map(Vec::len).sum::<usize>(),
                "Dispatching chunk group"
            );

            let outcomes =
                join_all(group.into_iter().map(|chunk| self.run_chunk(chunk, &handler))).await;

            let mut results = Vec::new();
            let mut failures = Vec::new();
            let mut last_key = i64::MIN;
            for outcome in outcomes {
                for (key, result) in outcome {
                    last_key = last_key.max(key);
                    match result {
                        Ok(value) => results.push(value),
                        Err(error) => failures.push(UnitFailure { key, error }),
                    }
                }
            }
            results.sort_by_key(|result| result.ordering_key());

            summary.processed += results.len();
            summary.failed += failures.len();
            summary.groups += 1;
            summary.last_key = Some(last_key);

            if !failures.is_empty() {
                tracing::warn!(
                    failed = failures.len(),
                    keys = ?failures.iter().map(|f| f.key).collect::<Vec<_>>(),
                    "Work units failed in chunk group"
                );
            }

            let flow = on_group(GroupOutcome {
                results,
                failures,
                last_key,
                processed_total: summary.processed,
                failed_total: summary.failed,
            })
            .await?;

            if flow == Flow::Halt {
                summary.halted = !chunks.is_empty();
                break;
            }
        }

        Ok(summary)
    }

    async fn run_chunk<U, R, H, HFut>(
        &self,
        chunk: Vec<U>,
        handler: &H,
    ) -> Vec<(i64, Result<R, String>)>
    where
        U: Keyed,
        H: Fn(U) -> HFut,
        HFut: Future<Output = anyhow::Result<R>>,
    {
        join_all(chunk.into_iter().map(|unit| {
            let key = unit.ordering_key();
            let work = handler(unit);
            async move {
                let result = match self.unit_timeout {
                    Some(limit) => match tokio::time::timeout(limit, work).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("timed out after {:?}", limit)),
                    },
                    None => work.await,
                };
                (key, result.map_err(|err| format!("{err:#}")))
            }
        }))
        .await
    }
}

fn partition<U>(units: Vec<U>, chunk_size: usize) -> Vec<Vec<U>> {
    let mut chunks = Vec::with_capacity(units.len().div_ceil(chunk_size));
    let mut current = Vec::with_capacity(chunk_size);
    for unit in units {
        current.push(unit);
        if current.len() == chunk_size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(chunk_size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::{
        convert::Infallible,
        sync::{Arc, Mutex},
    };

    #[rstest]
    #[case(1000, 8, 250)]
    #[case(3, 1, 3)]
    #[case(0, 4, 1)]
    #[case(10, 0, 10)]
    #[case(7, 5, 4)]
    fn test_plan_chunks(#[case] total: usize, #[case] workers: usize, #[case] expected: usize) {
        assert_eq!(plan_chunks(total, workers), expected);
    }

    #[test]
    fn test_partition_keeps_order() {
        let chunks = partition((1..=7).collect::<Vec<i64>>(), 3);
        assert_eq!(chunks, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
    }

    #[tokio::test]
    async fn test_failed_unit_does_not_block_siblings_or_next_chunk() {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sink = saved.clone();

        let summary = ChunkScheduler::default()
            .run(
                (1..=10).collect::<Vec<i64>>(),
                5,
                1,
                |unit| async move {
                    if unit == 3 {
                        Err(anyhow::anyhow!("unit 3 always fails"))
                    } else {
                        Ok(unit)
                    }
                },
                move |group: GroupOutcome<i64>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(group.results);
                        Ok::<_, Infallible>(Flow::Continue)
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(summary.processed, 9);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.groups, 2);
        assert_eq!(summary.last_key, Some(10));
        let saved = saved.lock().unwrap();
        assert_eq!(saved[0], vec![1, 2, 4, 5]);
        assert_eq!(saved[1], vec![6, 7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_results_sorted_despite_completion_order() {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sink = saved.clone();

        ChunkScheduler::default()
            .run(
                vec![1i64, 2, 3],
                3,
                1,
                |unit| async move {
                    // Unit 3 finishes first, unit 1 last.
                    tokio::time::sleep(Duration::from_millis((4 - unit as u64) * 10)).await;
                    Ok(unit)
                },
                move |group: GroupOutcome<i64>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().extend(group.results);
                        Ok::<_, Infallible>(Flow::Continue)
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(*saved.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unit_timeout_counts_as_failure() {
        let summary = ChunkScheduler::new(Some(Duration::from_millis(10)))
            .run(
                vec![1i64, 2],
                2,
                1,
                |unit| async move {
                    if unit == 2 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(unit)
                },
                |_group: GroupOutcome<i64>| async { Ok::<_, Infallible>(Flow::Continue) },
            )
            .await
            .unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_halt_stops_before_next_group() {
        let summary = ChunkScheduler::default()
            .run(
                (1..=6).collect::<Vec<i64>>(),
                2,
                1,
                |unit| async move { Ok(unit) },
                |_group: GroupOutcome<i64>| async { Ok::<_, Infallible>(Flow::Halt) },
            )
            .await
            .unwrap();

        assert_eq!(summary.groups, 1);
        assert_eq!(summary.processed, 2);
        assert!(summary.halted);
    }

    #[tokio::test]
    async fn test_group_error_aborts_run() {
        let result = ChunkScheduler::default()
            .run(
                (1..=4).collect::<Vec<i64>>(),
                2,
                1,
                |unit| async move { Ok(unit) },
                |_group: GroupOutcome<i64>| async { Err::<Flow, _>("save failed") },
            )
            .await;

        assert_eq!(result, Err("save failed"));
    }

    #[tokio::test]
    async fn test_concurrency_groups_chunks() {
        let groups = Arc::new(Mutex::new(Vec::new()));
        let sink = groups.clone();

        let summary = ChunkScheduler::default()
            .run(
                (1..=9).collect::<Vec<i64>>(),
                2,
                2,
                |unit| async move { Ok(unit) },
                move |group: GroupOutcome<i64>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push((group.results, group.last_key));
                        Ok::<_, Infallible>(Flow::Continue)
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(summary.groups, 3);
        let groups = groups.lock().unwrap();
        assert_eq!(groups[0], (vec![1, 2, 3, 4], 4));
        assert_eq!(groups[1], (vec![5, 6, 7, 8], 8));
        assert_eq!(groups[2], (vec![9], 9));
    }
}
