//! Staleness and publication-calendar checks.
//!
//! Everything here is pure: the current time is always passed in.

use crate::frequency::FrequencyClass;
use chrono::{DateTime, Datelike, Utc};
use std::time::Duration;

/// Whether data last refreshed at `last_refresh` has exceeded `sla` at `now`.
///
/// Never-refreshed data is stale. A refresh time in the future (clock skew)
/// counts as fresh.
pub fn is_stale(last_refresh: Option<DateTime<Utc>>, sla: Duration, now: DateTime<Utc>) -> bool {
    let Some(last) = last_refresh else {
        return true;
    };
    match (now - last).to_std() {
        Ok(age) => age >= sla,
        Err(_) => false,
    }
}

/// Publication calendar used to gate fetches for slow-moving classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicationCalendar {
    /// Monthly datasets are fetchable on calendar days `1..=monthly_window_days`
    pub monthly_window_days: u32,
}

impl Default for PublicationCalendar {
    fn default() -> Self {
        Self {
            monthly_window_days: 5,
        }
    }
}

impl PublicationCalendar {
    pub fn new(monthly_window_days: u32) -> Self {
        Self { monthly_window_days }
    }

    /// Whether datasets of `class` may be fetched at `now`
    pub fn can_fetch_now(&self, class: FrequencyClass, now: DateTime<Utc>) -> bool {
        match class {
            FrequencyClass::Monthly => now.day() <= self.monthly_window_days,
            // January, April, July, October
            FrequencyClass::Quarterly => now.month0() % 3 == 0,
            _ => true,
        }
    }
}
