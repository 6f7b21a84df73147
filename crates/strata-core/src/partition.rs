//! Partition keys and event-time bucketing.
//!
//! Raw data is partitioned by *creation* hour (`YYYYMMDD/HH`); final
//! artifacts are partitioned by *event* hour. Both use [`PartitionKey`].
//! Timestamps are UTC epoch milliseconds throughout.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};

/// Width of a live (Stage-1/Stage-2) time bucket: 5 minutes.
pub const BUCKET_WIDTH_MS: i64 = 5 * 60 * 1000;

/// Width of an archived (daily artifact) time bucket: 1 hour.
pub const HOUR_MS: i64 = 60 * 60 * 1000;

/// Milliseconds in a day.
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Aligns `ts_ms` down to the start of its `width_ms` bucket (epoch origin).
///
/// # Example
///
/// ```rust
/// use strata_core::partition::{bucket_start, BUCKET_WIDTH_MS};
///
/// // 10:03 lands in the 10:00 bucket, 10:58 in the 10:55 bucket.
/// assert_eq!(bucket_start(1_735_725_780_000, BUCKET_WIDTH_MS), 1_735_725_600_000);
/// assert_eq!(bucket_start(1_735_729_080_000, BUCKET_WIDTH_MS), 1_735_728_900_000);
/// ```
#[must_use]
pub const fn bucket_start(ts_ms: i64, width_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(width_ms)
}

/// Formats a date as a partition directory name (`YYYYMMDD`).
#[must_use]
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Parses a partition directory name (`YYYYMMDD`).
///
/// Returns `None` for anything that is not exactly eight digits forming a
/// valid calendar date, including staging names such as `20250101.deleting`.
#[must_use]
pub fn parse_date(name: &str) -> Option<NaiveDate> {
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(name, "%Y%m%d").ok()
}

/// Start of `date` (00:00:00 UTC).
#[must_use]
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Last second of `date` (23:59:59 UTC).
#[must_use]
pub fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    start_of_day(date) + Duration::hours(24) - Duration::seconds(1)
}

/// Returns every date from `from` to `to`, inclusive, in ascending order.
#[must_use]
pub fn dates_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut current = from.date_naive();
    let end = to.date_naive();
    while current <= end {
        dates.push(current);
        let Some(next) = current.succ_opt() else {
            break;
        };
        current = next;
    }
    dates
}

/// A `(date, hour)` partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    date: NaiveDate,
    hour: u32,
}

impl PartitionKey {
    /// Creates a key, validating the hour.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `hour` is not in `0..24`.
    pub fn new(date: NaiveDate, hour: u32) -> Result<Self> {
        if hour >= 24 {
            return Err(Error::InvalidInput(format!("hour out of range: {hour}")));
        }
        Ok(Self { date, hour })
    }

    /// The partition containing `ts`.
    #[must_use]
    pub fn from_datetime(ts: DateTime<Utc>) -> Self {
        Self {
            date: ts.date_naive(),
            hour: ts.hour(),
        }
    }

    /// The partition containing the epoch-millisecond timestamp `ms`.
    #[must_use]
    pub fn from_millis(ms: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(ms).map(Self::from_datetime)
    }

    /// Parses a key from its directory components (`"20250101"`, `"10"`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if either component is malformed.
    pub fn parse(date: &str, hour: &str) -> Result<Self> {
        let parsed_date = parse_date(date)
            .ok_or_else(|| Error::InvalidInput(format!("invalid partition date: {date}")))?;
        if hour.len() != 2 {
            return Err(Error::InvalidInput(format!("invalid partition hour: {hour}")));
        }
        let parsed_hour = hour
            .parse::<u32>()
            .map_err(|_| Error::InvalidInput(format!("invalid partition hour: {hour}")))?;
        Self::new(parsed_date, parsed_hour)
    }

    /// Partition date.
    #[must_use]
    pub const fn date(&self) -> NaiveDate {
        self.date
    }

    /// Partition hour (0-23).
    #[must_use]
    pub const fn hour(&self) -> u32 {
        self.hour
    }

    /// Date component as a directory name.
    #[must_use]
    pub fn date_str(&self) -> String {
        format_date(self.date)
    }

    /// Hour component as a two-digit string.
    #[must_use]
    pub fn hour_str(&self) -> String {
        format!("{:02}", self.hour)
    }

    /// Start of the hour.
    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        start_of_day(self.date) + Duration::hours(i64::from(self.hour))
    }

    /// Start of the hour in epoch milliseconds.
    #[must_use]
    pub fn start_millis(&self) -> i64 {
        self.start().timestamp_millis()
    }

    /// Every hour of `date`.
    pub fn hours_of(date: NaiveDate) -> impl Iterator<Item = Self> {
        (0..24).map(move |hour| Self { date, hour })
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}{:02}{:02}/{:02}",
            self.date.year(),
            self.date.month(),
            self.date.day(),
            self.hour
        )
    }
}

impl FromStr for PartitionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (date, hour) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidInput(format!("invalid partition key: {s}")))?;
        Self::parse(date, hour)
    }
}
