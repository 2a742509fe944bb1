use chrono::{DateTime, Datelike, NaiveDate, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::{
    batch::Keyed,
    schema::{dim_dates, fact_blocks, staging_blocks},
};

/// Raw block pulled from a chain, staged before warehouse transformation.
#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = staging_blocks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StagedBlockModel {
    pub chain: String,
    pub height: i64,
    pub block_hash: String,
    pub parent_hash: String,
    pub timestamp_ms: i64,
    pub extrinsics_count: i32,
    pub payload: serde_json::Value,
}

impl Keyed for StagedBlockModel {
    fn ordering_key(&self) -> i64 {
        self.height
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = dim_dates)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DateDimModel {
    pub date_key: i32,
    pub day: NaiveDate,
    pub year: i32,
    pub month: i32,
    pub day_of_month: i32,
}

impl DateDimModel {
    pub fn from_day(day: NaiveDate) -> Self {
        Self {
            date_key: date_key(day),
            day,
            year: day.year(),
            month: day.month() as i32,
            day_of_month: day.day() as i32,
        }
    }
}

/// `YYYYMMDD` surrogate key of the date dimension.
pub fn date_key(day: NaiveDate) -> i32 {
    day.year() * 10_000 + day.month() as i32 * 100 + day.day() as i32
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = fact_blocks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct FactBlockModel {
    pub chain: String,
    pub height: i64,
    pub block_hash: String,
    pub date_key: i32,
    pub block_time: DateTime<Utc>,
    pub extrinsics_count: i32,
    pub block_interval_ms: Option<i64>,
}

impl FactBlockModel {
    pub fn day(&self) -> NaiveDate {
        self.block_time.date_naive()
    }
}

impl Keyed for FactBlockModel {
    fn ordering_key(&self) -> i64 {
        self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_key_layout() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(date_key(day), 20240307);

        let dim = DateDimModel::from_day(day);
        assert_eq!(dim.year, 2024);
        assert_eq!(dim.month, 3);
        assert_eq!(dim.day_of_month, 7);
    }
}
