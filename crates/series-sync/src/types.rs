//! Request and response types for the series sync API

use chrono::{DateTime, Utc};
use series_cache::{CacheStats, FrequencyClass, TimeSeries};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
    /// Classes with no stored entry
    pub missing: Vec<FrequencyClass>,
}

/// One series from the combined view with its provenance
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResponse {
    pub name: String,
    pub frequency: FrequencyClass,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub series: TimeSeries,
}

#[derive(Debug, Default, Deserialize)]
pub struct AlignedQuery {
    /// Comma-separated series names; all series when absent
    pub series: Option<String>,
    #[serde(default)]
    pub ffill: bool,
}

impl AlignedQuery {
    pub fn names(&self) -> Option<Vec<String>> {
        self.series.as_ref().map(|s| {
            s.split(',')
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect()
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvalidateQuery {
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub pattern: String,
    pub deleted: usize,
}
