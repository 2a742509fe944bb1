use std::{fmt, str::FromStr};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{batch_logs, batch_records};

/// Declares a fieldless enum persisted as an upper-case text column.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(value: &str) -> Result<Self> {
                match value.to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(anyhow!("Invalid {} value: {}", stringify!($name), other)),
                }
            }
        }
    };
}

text_enum!(
    /// The pipeline phase a batch belongs to. Each stage has its own lock and lineage.
    StageType {
        Extract => "EXTRACT",
        Transform => "TRANSFORM",
    }
);

text_enum!(
    BatchStatus {
        Running => "RUNNING",
        Success => "SUCCESS",
        Failed => "FAILED",
        Paused => "PAUSED",
        Completed => "COMPLETED",
        Canceled => "CANCELED",
    }
);

text_enum!(
    LockStatus {
        Locked => "LOCKED",
        Unlocked => "UNLOCKED",
        Failed => "FAILED",
    }
);

text_enum!(
    LogLevel {
        Debug => "DEBUG",
        Info => "INFO",
        Warn => "WARN",
        Error => "ERROR",
    }
);

impl StageType {
    /// Lock name shared by every run of this stage.
    pub fn lock_key(&self) -> String {
        format!("{}_batch_lock", self.as_str().to_ascii_lowercase())
    }
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Success
                | BatchStatus::Failed
                | BatchStatus::Completed
                | BatchStatus::Canceled
        )
    }
}

/// One tracked execution attempt of a pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: i64,
    pub batch_key: Uuid,
    pub stage_type: StageType,
    pub status: BatchStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub processed_count: i64,
    pub failed_count: i64,
    pub last_processed_position: Option<i64>,
    pub target_position: Option<i64>,
    pub lock_key: String,
    pub lock_time: Option<DateTime<Utc>>,
    pub lock_status: LockStatus,
    pub error_detail: Option<String>,
    pub logs: Vec<BatchLogEntry>,
}

impl BatchRecord {
    /// A fresh record for a run that has just been granted its stage lock.
    pub fn started(id: i64, batch_key: Uuid, stage_type: StageType, now: DateTime<Utc>) -> Self {
        Self {
            id,
            batch_key,
            stage_type,
            status: BatchStatus::Running,
            start_time: now,
            end_time: None,
            retry_count: 0,
            processed_count: 0,
            failed_count: 0,
            last_processed_position: None,
            target_position: None,
            lock_key: stage_type.lock_key(),
            lock_time: Some(now),
            lock_status: LockStatus::Locked,
            error_detail: None,
            logs: Vec::new(),
        }
    }

    /// Whether this record holds a lock that has not outlived `lease`.
    pub fn holds_live_lock(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        self.lock_status == LockStatus::Locked
            && self.lock_time.map(|locked_at| locked_at + lease >= now).unwrap_or(false)
    }
}

impl fmt::Display for BatchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt<T: fmt::Display>(value: &Option<T>) -> String {
            value.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
        }

        writeln!(f, "id:                      {}", self.id)?;
        writeln!(f, "batch_key:               {}", self.batch_key)?;
        writeln!(f, "stage_type:              {}", self.stage_type)?;
        writeln!(f, "status:                  {}", self.status)?;
        writeln!(f, "start_time:              {}", self.start_time)?;
        writeln!(f, "end_time:                {}", opt(&self.end_time))?;
        writeln!(f, "retry_count:             {}", self.retry_count)?;
        writeln!(f, "processed_count:         {}", self.processed_count)?;
        writeln!(f, "failed_count:            {}", self.failed_count)?;
        writeln!(f, "last_processed_position: {}", opt(&self.last_processed_position))?;
        writeln!(f, "target_position:         {}", opt(&self.target_position))?;
        writeln!(f, "lock_key:                {}", self.lock_key)?;
        writeln!(f, "lock_time:               {}", opt(&self.lock_time))?;
        writeln!(f, "lock_status:             {}", self.lock_status)?;
        write!(f, "error_detail:            {}", opt(&self.error_detail))?;
        for entry in &self.logs {
            write!(f, "\n  [{}] {} {}", entry.timestamp, entry.level, entry.message)?;
            if let Some(detail) = &entry.detail {
                write!(f, " {}", detail)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

impl BatchLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self { timestamp: Utc::now(), level, message: message.into(), detail: None }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = batch_records)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BatchRecordRow {
    pub id: i64,
    pub batch_key: Uuid,
    pub stage_type: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub processed_count: i64,
    pub failed_count: i64,
    pub last_processed_position: Option<i64>,
    pub target_position: Option<i64>,
    pub lock_key: String,
    pub lock_time: Option<DateTime<Utc>>,
    pub lock_status: String,
    pub error_detail: Option<String>,
}

impl BatchRecordRow {
    pub fn into_record(self, logs: Vec<BatchLogEntry>) -> Result<BatchRecord> {
        Ok(BatchRecord {
            id: self.id,
            batch_key: self.batch_key,
            stage_type: self.stage_type.parse()?,
            status: self.status.parse()?,
            start_time: self.start_time,
            end_time: self.end_time,
            retry_count: self.retry_count,
            processed_count: self.processed_count,
            failed_count: self.failed_count,
            last_processed_position: self.last_processed_position,
            target_position: self.target_position,
            lock_key: self.lock_key,
            lock_time: self.lock_time,
            lock_status: self.lock_status.parse()?,
            error_detail: self.error_detail,
            logs,
        })
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = batch_records)]
pub struct NewBatchRecordRow {
    pub batch_key: Uuid,
    pub stage_type: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub lock_key: String,
    pub lock_time: Option<DateTime<Utc>>,
    pub lock_status: String,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = batch_logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BatchLogRow {
    pub id: i64,
    pub batch_id: i64,
    pub logged_at: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

impl TryFrom<BatchLogRow> for BatchLogEntry {
    type Error = anyhow::Error;

    fn try_from(row: BatchLogRow) -> Result<Self> {
        Ok(Self {
            timestamp: row.logged_at,
            level: row.level.parse()?,
            message: row.message,
            detail: row.detail,
        })
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = batch_logs)]
pub struct NewBatchLogRow {
    pub batch_id: i64,
    pub logged_at: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}
