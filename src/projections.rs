//! Histograms derived from the record store's sparse bucket counts.
//!
//! The store reports only the buckets that have rows, keyed by fixed-width
//! labels such as `"05"`. Everything here turns those into dense series
//! over a fixed domain so every hour, day or month is present exactly once.

use std::ops::RangeInclusive;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

/// Sparse `(label, count)` rows as returned by a bucket query.
pub type SparseCounts = Vec<(String, u64)>;

/// One entry of a dense histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub key: u32,
    pub count: u64,
}

/// Fixed key domains for the three histogram shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Hours of the day, `0..=23`.
    Hours,
    /// Days `1..=days` of a calendar month.
    DaysOfMonth { days: u32 },
    /// Calendar months `1..=12`.
    Months,
}

impl Domain {
    /// Day domain for the month containing `today`. Computed per call so a
    /// long-running process picks up month boundaries.
    pub fn days_of_month(today: NaiveDate) -> Self {
        Self::DaysOfMonth {
            days: days_in_month(today.year(), today.month()),
        }
    }

    pub fn keys(&self) -> RangeInclusive<u32> {
        match self {
            Self::Hours => 0..=23,
            Self::DaysOfMonth { days } => 1..=*days,
            Self::Months => 1..=12,
        }
    }

    pub fn contains(&self, key: u32) -> bool {
        self.keys().contains(&key)
    }

    pub fn len(&self) -> usize {
        self.keys().count()
    }
}

/// Parses a raw bucket label into a key of `domain`.
///
/// Returns `None` for anything non-numeric or outside the domain.
pub fn parse_bucket_key(domain: &Domain, label: &str) -> Option<u32> {
    let key = label.trim().parse::<u32>().ok()?;
    domain.contains(key).then_some(key)
}

/// Fills `sparse` into one bucket per domain key, in ascending key order.
///
/// Unparseable or out-of-domain labels are dropped. Labels that parse to the
/// same key are summed.
pub fn densify(domain: &Domain, sparse: &[(String, u64)]) -> Vec<Bucket> {
    let start = *domain.keys().start();
    let mut counts = vec![0u64; domain.len()];

    for (label, count) in sparse {
        match parse_bucket_key(domain, label) {
            Some(key) => counts[(key - start) as usize] += count,
            None => tracing::debug!(?domain, label = %label, "dropping malformed bucket label"),
        }
    }

    domain
        .keys()
        .zip(counts)
        .map(|(key, count)| Bucket { key, count })
        .collect()
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month >= 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(31, |last| last.day())
}

/// First day of `today`'s month.
pub fn month_start(today: NaiveDate) -> NaiveDate {
    shift_months(today, 0)
}

/// First day of the month after `today`'s.
pub fn next_month_start(today: NaiveDate) -> NaiveDate {
    shift_months(today, 1)
}

/// First day of the trailing twelve-month window ending with `today`'s month.
pub fn trailing_year_start(today: NaiveDate) -> NaiveDate {
    shift_months(today, -11)
}

fn shift_months(today: NaiveDate, delta: i32) -> NaiveDate {
    let index = today.year() * 12 + today.month0() as i32 + delta;
    let (year, month0) = (index.div_euclid(12), index.rem_euclid(12));
    NaiveDate::from_ymd_opt(year, month0 as u32 + 1, 1).unwrap_or(today)
}
