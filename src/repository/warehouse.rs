use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use diesel::{
    insert_into, upsert::excluded, ExpressionMethods, OptionalExtension, QueryDsl,
    SelectableHelper,
};
use diesel_async::{scoped_futures::ScopedFutureExt, AsyncConnection, RunQueryDsl};

use crate::{
    db::DbPool,
    models::{DateDimModel, FactBlockModel, StagedBlockModel},
    schema::{dim_dates, fact_blocks, staging_blocks},
};

/// Upsert staged blocks. Re-extracting a height overwrites the previous copy.
pub async fn insert_staged_blocks(db: Arc<DbPool>, blocks: &[StagedBlockModel]) -> Result<()> {
    if blocks.is_empty() {
        return Ok(());
    }
    let mut conn = db.get().await?;
    insert_into(staging_blocks::table)
        .values(blocks)
        .on_conflict((staging_blocks::chain, staging_blocks::height))
        .do_update()
        .set((
            staging_blocks::block_hash.eq(excluded(staging_blocks::block_hash)),
            staging_blocks::parent_hash.eq(excluded(staging_blocks::parent_hash)),
            staging_blocks::timestamp_ms.eq(excluded(staging_blocks::timestamp_ms)),
            staging_blocks::extrinsics_count.eq(excluded(staging_blocks::extrinsics_count)),
            staging_blocks::payload.eq(excluded(staging_blocks::payload)),
        ))
        .execute(&mut conn)
        .await?;
    Ok(())
}

pub async fn get_staged_block(
    db: &Arc<DbPool>,
    chain: &str,
    height: i64,
) -> Result<Option<StagedBlockModel>> {
    let mut conn = db.get().await?;
    let block = staging_blocks::table
        .filter(staging_blocks::chain.eq(chain))
        .filter(staging_blocks::height.eq(height))
        .select(StagedBlockModel::as_select())
        .first(&mut conn)
        .await
        .optional()?;
    Ok(block)
}

/// Timestamp of the closest staged block below `height`, if any.
pub async fn get_previous_timestamp(
    db: &Arc<DbPool>,
    chain: &str,
    height: i64,
) -> Result<Option<i64>> {
    let mut conn = db.get().await?;
    let ts = staging_blocks::table
        .filter(staging_blocks::chain.eq(chain))
        .filter(staging_blocks::height.lt(height))
        .order(staging_blocks::height.desc())
        .select(staging_blocks::timestamp_ms)
        .first::<i64>(&mut conn)
        .await
        .optional()?;
    Ok(ts)
}

pub async fn get_staged_heights(
    db: &Arc<DbPool>,
    chain: &str,
    from: i64,
    to: i64,
) -> Result<Vec<i64>> {
    let mut conn = db.get().await?;
    let heights = staging_blocks::table
        .filter(staging_blocks::chain.eq(chain))
        .filter(staging_blocks::height.between(from, to))
        .order(staging_blocks::height.asc())
        .select(staging_blocks::height)
        .load::<i64>(&mut conn)
        .await?;
    Ok(heights)
}

pub async fn get_max_staged_height(db: &Arc<DbPool>, chain: &str) -> Result<Option<i64>> {
    let mut conn = db.get().await?;
    let height = staging_blocks::table
        .filter(staging_blocks::chain.eq(chain))
        .select(diesel::dsl::max(staging_blocks::height))
        .first::<Option<i64>>(&mut conn)
        .await?;
    Ok(height)
}

pub async fn get_min_staged_height(db: &Arc<DbPool>, chain: &str) -> Result<Option<i64>> {
    let mut conn = db.get().await?;
    let height = staging_blocks::table
        .filter(staging_blocks::chain.eq(chain))
        .select(diesel::dsl::min(staging_blocks::height))
        .first::<Option<i64>>(&mut conn)
        .await?;
    Ok(height)
}

pub async fn get_staged_timestamp(
    db: &Arc<DbPool>,
    chain: &str,
    height: i64,
) -> Result<Option<i64>> {
    let mut conn = db.get().await?;
    let ts = staging_blocks::table
        .filter(staging_blocks::chain.eq(chain))
        .filter(staging_blocks::height.eq(height))
        .select(staging_blocks::timestamp_ms)
        .first::<i64>(&mut conn)
        .await
        .optional()?;
    Ok(ts)
}

/// Write fact rows and the date dimension rows they reference in one transaction.
pub async fn insert_fact_blocks(db: Arc<DbPool>, facts: &[FactBlockModel]) -> Result<()> {
    if facts.is_empty() {
        return Ok(());
    }
    let dates: Vec<DateDimModel> = facts
        .iter()
        .map(|fact| (fact.date_key, fact.day()))
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .map(DateDimModel::from_day)
        .collect();

    let mut conn = db.get().await?;
    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        async move {
            insert_into(dim_dates::table)
                .values(&dates)
                .on_conflict(dim_dates::date_key)
                .do_nothing()
                .execute(conn)
                .await?;

            insert_into(fact_blocks::table)
                .values(facts)
                .on_conflict((fact_blocks::chain, fact_blocks::height))
                .do_update()
                .set((
                    fact_blocks::block_hash.eq(excluded(fact_blocks::block_hash)),
                    fact_blocks::date_key.eq(excluded(fact_blocks::date_key)),
                    fact_blocks::block_time.eq(excluded(fact_blocks::block_time)),
                    fact_blocks::extrinsics_count.eq(excluded(fact_blocks::extrinsics_count)),
                    fact_blocks::block_interval_ms.eq(excluded(fact_blocks::block_interval_ms)),
                ))
                .execute(conn)
                .await?;
            Ok(())
        }
        .scope_boxed()
    })
    .await?;
    Ok(())
}
