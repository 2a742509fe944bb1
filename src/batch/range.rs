use std::{future::Future, sync::OnceLock, time::Duration};

use anyhow::{anyhow, Result};
use regex::Regex;

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;

/// How the positions of a run are chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeRequest {
    /// From the stage's last persisted position up to the latest available.
    Incremental,
    /// An explicit inclusive range; runs once.
    Explicit { start: i64, end: i64 },
    /// Everything produced within the given wall-clock window; runs once.
    Lookback(Duration),
}

impl RangeRequest {
    /// Bounded requests are one-shot: the interval loop exits after them.
    pub fn is_bounded(&self) -> bool {
        !matches!(self, RangeRequest::Incremental)
    }
}

/// Inclusive range of ordering keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitRange {
    pub start: i64,
    pub end: i64,
}

impl UnitRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start + 1) as usize
        }
    }

    /// Cut the range so it spans at most `max_units` positions from its start.
    pub fn capped(self, max_units: Option<usize>) -> Self {
        match max_units {
            Some(max) if max > 0 && self.len() > max => {
                Self { start: self.start, end: self.start + max as i64 - 1 }
            }
            _ => self,
        }
    }

    /// Drop every position at or before `cursor`.
    pub fn after(self, cursor: Option<i64>) -> Self {
        match cursor {
            Some(cursor) if cursor >= self.start => Self { start: cursor + 1, end: self.end },
            _ => self,
        }
    }

    pub fn positions(&self) -> impl Iterator<Item = i64> {
        self.start..=self.end
    }
}

fn lookback_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)(h|d|w|m|y)$").expect("static regex"))
}

/// Parse a lookback window such as `2h`, `7d`, `1w`, `3m` (30-day months) or `1y`.
pub fn parse_lookback(value: &str) -> Result<Duration> {
    let captures = lookback_pattern()
        .captures(value.trim())
        .ok_or_else(|| anyhow!("Invalid lookback '{}', expected <number><h|d|w|m|y>", value))?;

    let amount: u64 = captures[1].parse()?;
    let unit_ms = match &captures[2] {
        "h" => HOUR_MS,
        "d" => DAY_MS,
        "w" => 7 * DAY_MS,
        "m" => 30 * DAY_MS,
        "y" => 365 * DAY_MS,
        other => return Err(anyhow!("Unsupported lookback unit '{}'", other)),
    };
    let millis = amount
        .checked_mul(unit_ms)
        .ok_or_else(|| anyhow!("Lookback '{}' is too large", value))?;
    Ok(Duration::from_millis(millis))
}

/// Smallest position in `[low, high]` whose timestamp is at or after
/// `target_ms`, assuming timestamps grow with position. `None` when even
/// `high` is older than the target.
pub async fn position_at_or_after<F, Fut>(
    target_ms: i64,
    low: i64,
    high: i64,
    mut timestamp_of: F,
) -> Result<Option<i64>>
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = Result<i64>>,
{
    if low > high || timestamp_of(high).await? < target_ms {
        return Ok(None);
    }

    let (mut low, mut high) = (low, high);
    while low < high {
        let mid = low + (high - low) / 2;
        if timestamp_of(mid).await? >= target_ms {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    Ok(Some(low))
}
