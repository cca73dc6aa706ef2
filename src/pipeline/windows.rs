//! Batch window iteration
//!
//! Two flavors of contiguous, gap-free, non-overlapping sub-ranges:
//! - `BlockWindows`: fixed block-count steps over an inclusive `[from, to]`
//! - `CalendarWindows`: half-open `(start, end]` time windows cut at UTC
//!   hour or day boundaries
//!
//! `iterate` drives an async callback over either, strictly one window at a
//! time, stopping at the first error.

use crate::error::Result;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;

/// Fixed-size block windows over inclusive `[from, to]`.
///
/// `from > to` yields nothing; a step of 0 is treated as 1.
#[derive(Debug, Clone)]
pub struct BlockWindows {
    next: Option<u64>,
    to: u64,
    step: u64,
}

impl BlockWindows {
    pub fn new(from: u64, to: u64, step: u64) -> Self {
        Self {
            next: if from <= to { Some(from) } else { None },
            to,
            step: step.max(1),
        }
    }
}

impl Iterator for BlockWindows {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next?;
        let end = start.saturating_add(self.step - 1).min(self.to);
        self.next = if end >= self.to { None } else { Some(end + 1) };
        Some((start, end))
    }
}

/// Bucket granularity for time-series metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
}

impl Granularity {
    pub fn seconds(&self) -> i64 {
        match self {
            Granularity::Hourly => 3_600,
            Granularity::Daily => 86_400,
        }
    }

    fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Greatest boundary `<= ts` (UTC).
    pub fn floor(&self, ts: i64) -> i64 {
        DateTime::<Utc>::from_timestamp(ts, 0)
            .and_then(|dt| dt.duration_trunc(self.duration()).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or_else(|| ts - ts.rem_euclid(self.seconds()))
    }

    /// Smallest boundary `>= ts`. This is the label of the bucket that
    /// contains `ts` under the `(start, end]` policy.
    pub fn ceil(&self, ts: i64) -> i64 {
        let floor = self.floor(ts);
        if floor == ts {
            ts
        } else {
            floor + self.seconds()
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
        }
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" | "hour" | "1h" => Ok(Granularity::Hourly),
            "daily" | "day" | "1d" => Ok(Granularity::Daily),
            other => Err(format!("unknown granularity: {}", other)),
        }
    }
}

/// Calendar windows over `(from, to]`.
///
/// The first window starts at `from`; every interior boundary is a calendar
/// floor; the last window ends at `to`.
#[derive(Debug, Clone)]
pub struct CalendarWindows {
    cursor: i64,
    to: i64,
    granularity: Granularity,
}

impl CalendarWindows {
    pub fn new(from: i64, to: i64, granularity: Granularity) -> Self {
        Self { cursor: from, to, granularity }
    }
}

impl Iterator for CalendarWindows {
    type Item = (i64, i64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.to {
            return None;
        }
        let start = self.cursor;
        let end = (self.granularity.floor(start) + self.granularity.seconds()).min(self.to);
        self.cursor = end;
        Some((start, end))
    }
}

/// Invoke `f` on each window in order. The loop stops at the first error
/// and returns it; results of the windows that completed are discarded with
/// it, which is why callers commit per window.
pub async fn iterate<W, I, F, Fut, T>(windows: I, mut f: F) -> Result<Vec<T>>
where
    W: Copy,
    I: IntoIterator<Item = (W, W)>,
    F: FnMut(W, W) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut results = Vec::new();
    for (start, end) in windows {
        results.push(f(start, end).await?);
    }
    Ok(results)
}
