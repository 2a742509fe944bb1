use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::{
    insert_into, sql_types::Text, update, BoolExpressionMethods, ExpressionMethods,
    OptionalExtension, QueryDsl, SelectableHelper,
};
use diesel_async::{
    scoped_futures::ScopedFutureExt, AsyncConnection, AsyncPgConnection, RunQueryDsl,
};
use uuid::Uuid;

use super::{
    resumable_statuses, terminal_statuses, BatchSnapshot, BatchStore, LockClaim, LockRequest,
    ProgressAck, ProgressDelta, EXPIRED_LEASE_DETAIL,
};
use crate::{
    db::DbPool,
    models::{
        BatchLogEntry, BatchLogRow, BatchRecord, BatchRecordRow, BatchStatus, LockStatus,
        NewBatchLogRow, NewBatchRecordRow, StageType,
    },
    schema::{batch_logs, batch_records},
};

/// Postgres-backed batch store.
///
/// Lock acquisition runs in one transaction serialized per lock key by
/// `pg_advisory_xact_lock`, with the partial unique index on live holders as
/// a backstop.
pub struct PgBatchStore {
    db_pool: Arc<DbPool>,
}

impl PgBatchStore {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    async fn load_record(
        conn: &mut AsyncPgConnection,
        row: Option<BatchRecordRow>,
    ) -> Result<Option<BatchRecord>> {
        let Some(row) = row else {
            return Ok(None);
        };
        let logs = batch_logs::table
            .filter(batch_logs::batch_id.eq(row.id))
            .order(batch_logs::id.asc())
            .select(BatchLogRow::as_select())
            .load::<BatchLogRow>(conn)
            .await?
            .into_iter()
            .map(BatchLogEntry::try_from)
            .collect::<Result<Vec<_>>>()?;
        row.into_record(logs).map(Some)
    }

    async fn expire_holder(
        conn: &mut AsyncPgConnection,
        holder: &BatchRecordRow,
        now: DateTime<Utc>,
    ) -> Result<()> {
        tracing::warn!(
            batch_key = %holder.batch_key,
            lock_key = holder.lock_key,
            "Reclaiming lock whose lease expired"
        );
        if holder.status == BatchStatus::Running.as_str() {
            update(batch_records::table.find(holder.id))
                .set((
                    batch_records::lock_status.eq(LockStatus::Failed.as_str()),
                    batch_records::lock_time.eq(Some(now)),
                    batch_records::status.eq(BatchStatus::Failed.as_str()),
                    batch_records::end_time.eq(Some(now)),
                    batch_records::error_detail.eq(Some(EXPIRED_LEASE_DETAIL)),
                ))
                .execute(conn)
                .await?;
        } else {
            update(batch_records::table.find(holder.id))
                .set((
                    batch_records::lock_status.eq(LockStatus::Failed.as_str()),
                    batch_records::lock_time.eq(Some(now)),
                ))
                .execute(conn)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    async fn acquire_lock(
        &self,
        request: &LockRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchRecord>> {
        let mut conn = self.db_pool.get().await?;
        let request = request.clone();

        let row = conn
            .transaction::<_, anyhow::Error, _>(|conn| {
                async move {
                    diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
                        .bind::<Text, _>(&request.lock_key)
                        .execute(conn)
                        .await?;

                    let holders: Vec<BatchRecordRow> = batch_records::table
                        .filter(batch_records::lock_key.eq(&request.lock_key))
                        .filter(batch_records::lock_status.eq(LockStatus::Locked.as_str()))
                        .select(BatchRecordRow::as_select())
                        .for_update()
                        .load(conn)
                        .await?;

                    let cutoff = now - request.lease;
                    let live = holders
                        .iter()
                        .any(|holder| holder.lock_time.map(|t| t >= cutoff).unwrap_or(false));
                    if live {
                        return Ok(None);
                    }

                    let claimed = request.claim.batch_key();
                    for holder in holders.iter().filter(|holder| holder.batch_key != claimed) {
                        Self::expire_holder(conn, holder, now).await?;
                    }

                    let row = match request.claim {
                        LockClaim::New { batch_key, stage_type } => {
                            insert_into(batch_records::table)
                                .values(NewBatchRecordRow {
                                    batch_key,
                                    stage_type: stage_type.as_str().to_string(),
                                    status: BatchStatus::Running.as_str().to_string(),
                                    start_time: now,
                                    lock_key: request.lock_key.clone(),
                                    lock_time: Some(now),
                                    lock_status: LockStatus::Locked.as_str().to_string(),
                                })
                                .returning(BatchRecordRow::as_returning())
                                .get_result(conn)
                                .await?
                        }
                        LockClaim::Resume { batch_key } => {
                            let current: BatchRecordRow = batch_records::table
                                .filter(batch_records::batch_key.eq(batch_key))
                                .select(BatchRecordRow::as_select())
                                .for_update()
                                .first(conn)
                                .await
                                .optional()?
                                .ok_or_else(|| anyhow!("batch {} not found", batch_key))?;

                            let status: BatchStatus = current.status.parse()?;
                            if status.is_terminal() {
                                return Err(anyhow!(
                                    "batch {} is {} and cannot be resumed",
                                    batch_key,
                                    status
                                ));
                            }
                            // Re-entering a RUNNING record means its previous owner crashed.
                            let retry_count = if status == BatchStatus::Running {
                                current.retry_count + 1
                            } else {
                                current.retry_count
                            };

                            update(batch_records::table.find(current.id))
                                .set((
                                    batch_records::status.eq(BatchStatus::Running.as_str()),
                                    batch_records::lock_key.eq(&request.lock_key),
                                    batch_records::lock_status.eq(LockStatus::Locked.as_str()),
                                    batch_records::lock_time.eq(Some(now)),
                                    batch_records::retry_count.eq(retry_count),
                                    batch_records::end_time.eq(None::<DateTime<Utc>>),
                                ))
                                .returning(BatchRecordRow::as_returning())
                                .get_result(conn)
                                .await?
                        }
                    };
                    Ok(Some(row))
                }
                .scope_boxed()
            })
            .await
            .context("Failed to acquire batch lock")?;

        Self::load_record(&mut conn, row).await
    }

    async fn release_lock(
        &self,
        batch_key: Uuid,
        lock_status: LockStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.db_pool.get().await?;
        update(batch_records::table.filter(batch_records::batch_key.eq(batch_key)))
            .set((
                batch_records::lock_status.eq(lock_status.as_str()),
                batch_records::lock_time.eq(Some(now)),
            ))
            .execute(&mut conn)
            .await
            .context("Failed to release batch lock")?;
        Ok(())
    }

    async fn record_progress(
        &self,
        batch_key: Uuid,
        delta: &ProgressDelta,
        now: DateTime<Utc>,
    ) -> Result<ProgressAck> {
        let mut conn = self.db_pool.get().await?;

        let advanced: Option<String> = update(
            batch_records::table
                .filter(batch_records::batch_key.eq(batch_key))
                .filter(batch_records::lock_status.eq(LockStatus::Locked.as_str()))
                .filter(
                    batch_records::last_processed_position
                        .is_null()
                        .or(batch_records::last_processed_position.lt(delta.position)),
                ),
        )
        .set((
            batch_records::processed_count.eq(batch_records::processed_count + delta.processed),
            batch_records::failed_count.eq(batch_records::failed_count + delta.failed),
            batch_records::last_processed_position.eq(Some(delta.position)),
            batch_records::lock_time.eq(Some(now)),
        ))
        .returning(batch_records::status)
        .get_result(&mut conn)
        .await
        .optional()
        .context("Failed to record progress")?;

        let (applied, status) = match advanced {
            Some(status) => (true, status),
            None => {
                let status = batch_records::table
                    .filter(batch_records::batch_key.eq(batch_key))
                    .select(batch_records::status)
                    .first::<String>(&mut conn)
                    .await
                    .optional()?
                    .ok_or_else(|| anyhow!("batch {} not found", batch_key))?;
                (false, status)
            }
        };
        Ok(ProgressAck { applied, status: status.parse()? })
    }

    async fn set_target_position(&self, batch_key: Uuid, target: i64) -> Result<()> {
        let mut conn = self.db_pool.get().await?;
        update(batch_records::table.filter(batch_records::batch_key.eq(batch_key)))
            .set(batch_records::target_position.eq(Some(target)))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn finalize(&self, snapshot: &BatchSnapshot) -> Result<bool> {
        let mut conn = self.db_pool.get().await?;
        let snapshot = snapshot.clone();

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                let current: BatchRecordRow = batch_records::table
                    .filter(batch_records::batch_key.eq(snapshot.batch_key))
                    .select(BatchRecordRow::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or_else(|| anyhow!("batch {} not found", snapshot.batch_key))?;

                let status: BatchStatus = current.status.parse()?;
                if status.is_terminal() {
                    return Ok(false);
                }

                update(batch_records::table.find(current.id))
                    .set((
                        batch_records::status.eq(snapshot.status.as_str()),
                        batch_records::end_time.eq(Some(snapshot.end_time)),
                        batch_records::processed_count
                            .eq(current.processed_count.max(snapshot.processed_count)),
                        batch_records::failed_count
                            .eq(current.failed_count.max(snapshot.failed_count)),
                        batch_records::last_processed_position.eq(current
                            .last_processed_position
                            .max(snapshot.last_processed_position)),
                        batch_records::error_detail.eq(snapshot.error_detail.as_deref()),
                        batch_records::retry_count
                            .eq(current.retry_count + snapshot.retry_increment),
                    ))
                    .execute(conn)
                    .await?;
                Ok(true)
            }
            .scope_boxed()
        })
        .await
        .context("Failed to finalize batch")
    }

    async fn transition(
        &self,
        id: i64,
        from: &[BatchStatus],
        to: BatchStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchRecord>> {
        let mut conn = self.db_pool.get().await?;
        let from: Vec<&str> = from.iter().map(|status| status.as_str()).collect();
        let end_time = to.is_terminal().then_some(now);

        let row = update(
            batch_records::table
                .filter(batch_records::id.eq(id))
                .filter(batch_records::status.eq_any(from)),
        )
        .set((batch_records::status.eq(to.as_str()), batch_records::end_time.eq(end_time)))
        .returning(BatchRecordRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;

        Self::load_record(&mut conn, row).await
    }

    async fn append_log(&self, batch_key: Uuid, entry: &BatchLogEntry) -> Result<()> {
        let mut conn = self.db_pool.get().await?;
        let batch_id = batch_records::table
            .filter(batch_records::batch_key.eq(batch_key))
            .select(batch_records::id)
            .first::<i64>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| anyhow!("batch {} not found", batch_key))?;

        insert_into(batch_logs::table)
            .values(NewBatchLogRow {
                batch_id,
                logged_at: entry.timestamp,
                level: entry.level.as_str().to_string(),
                message: entry.message.clone(),
                detail: entry.detail.clone(),
            })
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<BatchRecord>> {
        let mut conn = self.db_pool.get().await?;
        let row = batch_records::table
            .find(id)
            .select(BatchRecordRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Self::load_record(&mut conn, row).await
    }

    async fn find_by_key(&self, batch_key: Uuid) -> Result<Option<BatchRecord>> {
        let mut conn = self.db_pool.get().await?;
        let row = batch_records::table
            .filter(batch_records::batch_key.eq(batch_key))
            .select(BatchRecordRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Self::load_record(&mut conn, row).await
    }

    async fn latest(&self, stage_type: StageType) -> Result<Option<BatchRecord>> {
        let mut conn = self.db_pool.get().await?;
        let row = batch_records::table
            .filter(batch_records::stage_type.eq(stage_type.as_str()))
            .order(batch_records::id.desc())
            .select(BatchRecordRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Self::load_record(&mut conn, row).await
    }

    async fn latest_terminal(&self, stage_type: StageType) -> Result<Option<BatchRecord>> {
        let mut conn = self.db_pool.get().await?;
        let statuses: Vec<&str> = terminal_statuses().iter().map(|s| s.as_str()).collect();
        let row = batch_records::table
            .filter(batch_records::stage_type.eq(stage_type.as_str()))
            .filter(batch_records::status.eq_any(statuses))
            .order(batch_records::id.desc())
            .select(BatchRecordRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Self::load_record(&mut conn, row).await
    }

    async fn latest_non_terminal(&self, stage_type: StageType) -> Result<Option<BatchRecord>> {
        let mut conn = self.db_pool.get().await?;
        let statuses: Vec<&str> = resumable_statuses().iter().map(|s| s.as_str()).collect();
        let row = batch_records::table
            .filter(batch_records::stage_type.eq(stage_type.as_str()))
            .filter(batch_records::status.eq_any(statuses))
            .order(batch_records::id.desc())
            .select(BatchRecordRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Self::load_record(&mut conn, row).await
    }

    async fn last_position(&self, stage_type: StageType) -> Result<Option<i64>> {
        let mut conn = self.db_pool.get().await?;
        let position = batch_records::table
            .filter(batch_records::stage_type.eq(stage_type.as_str()))
            .select(diesel::dsl::max(batch_records::last_processed_position))
            .first::<Option<i64>>(&mut conn)
            .await?;
        Ok(position)
    }
}
