//! Core data model: series, descriptors, cache entries, refresh outcomes

use crate::error::{Result, SyncError};
use crate::frequency::{FrequencyClass, SlaTable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// A single (timestamp, value) pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Ordered sequence of observations with unique, increasing timestamps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSeries {
    points: Vec<Observation>,
}

impl TimeSeries {
    /// Build a series from arbitrary points.
    ///
    /// Points are sorted by timestamp, non-finite values are dropped, and for
    /// duplicate timestamps the point that came last in the input wins.
    pub fn from_points(points: impl IntoIterator<Item = Observation>) -> Self {
        let by_time: BTreeMap<DateTime<Utc>, f64> = points
            .into_iter()
            .filter(|p| p.value.is_finite())
            .map(|p| (p.timestamp, p.value))
            .collect();
        Self {
            points: by_time
                .into_iter()
                .map(|(timestamp, value)| Observation { timestamp, value })
                .collect(),
        }
    }

    pub fn points(&self) -> &[Observation] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.points.last().map(|p| p.timestamp)
    }

    pub fn value_at(&self, timestamp: DateTime<Utc>) -> Option<f64> {
        self.points
            .binary_search_by(|p| p.timestamp.cmp(&timestamp))
            .ok()
            .map(|i| self.points[i].value)
    }

    /// Overlay `newer` on top of this series; newer values win on equal timestamps
    pub fn merged_with(&self, newer: &TimeSeries) -> TimeSeries {
        TimeSeries::from_points(self.points.iter().chain(newer.points.iter()).copied())
    }
}

/// Pacing policy for calls to the external fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_calls: u32,
    pub window_secs: u64,
}

impl RateLimit {
    /// Minimum spacing between two successive calls
    pub fn interval(&self) -> Duration {
        if self.max_calls == 0 {
            return Duration::from_secs(self.window_secs);
        }
        Duration::from_secs(self.window_secs) / self.max_calls
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_calls: 5,
            window_secs: 1,
        }
    }
}

/// Identity and refresh policy for one external series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub id: String,
    pub frequency: FrequencyClass,
    /// Assigned from the SLA table when the catalog is built
    #[serde(skip)]
    pub sla: Duration,
    #[serde(default)]
    pub fetch_params: BTreeMap<String, String>,
    #[serde(default)]
    pub requires_credential: bool,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

impl DatasetDescriptor {
    pub fn new(id: impl Into<String>, frequency: FrequencyClass) -> Self {
        Self {
            id: id.into(),
            frequency,
            sla: frequency.default_sla(),
            fetch_params: BTreeMap::new(),
            requires_credential: false,
            rate_limit: None,
        }
    }
}

/// Immutable set of dataset descriptors, defined at configuration time
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    datasets: Vec<DatasetDescriptor>,
}

impl Catalog {
    /// Build a catalog, assigning each descriptor its class SLA
    pub fn new(datasets: Vec<DatasetDescriptor>, slas: &SlaTable) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut datasets = datasets;
        for dataset in &mut datasets {
            if dataset.id.trim().is_empty() {
                return Err(SyncError::Config("dataset id must not be empty".to_string()));
            }
            if !seen.insert(dataset.id.clone()) {
                return Err(SyncError::Config(format!("duplicate dataset id '{}'", dataset.id)));
            }
            dataset.sla = slas.sla(dataset.frequency);
        }
        Ok(Self { datasets })
    }

    /// Parse a JSON array of descriptors
    pub fn from_json(json: &str, slas: &SlaTable) -> Result<Self> {
        let datasets: Vec<DatasetDescriptor> = serde_json::from_str(json)?;
        Self::new(datasets, slas)
    }

    pub fn for_class(&self, class: FrequencyClass) -> impl Iterator<Item = &DatasetDescriptor> {
        self.datasets.iter().filter(move |d| d.frequency == class)
    }

    /// Classes with at least one dataset, fastest first
    pub fn classes(&self) -> Vec<FrequencyClass> {
        let mut classes: Vec<FrequencyClass> = self.datasets.iter().map(|d| d.frequency).collect();
        classes.sort();
        classes.dedup();
        classes
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

/// One persisted bucket of series sharing a frequency class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyCacheEntry {
    pub frequency: FrequencyClass,
    pub payload: BTreeMap<String, TimeSeries>,
    pub refreshed_at: DateTime<Utc>,
    pub item_count: usize,
}

impl FrequencyCacheEntry {
    pub fn new(
        frequency: FrequencyClass,
        payload: BTreeMap<String, TimeSeries>,
        refreshed_at: DateTime<Utc>,
    ) -> Self {
        let item_count = payload.len();
        Self {
            frequency,
            payload,
            refreshed_at,
            item_count,
        }
    }

    pub fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            refreshed_at: self.refreshed_at,
            item_count: self.item_count,
        }
    }
}

/// Metadata of a stored entry, readable without the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub refreshed_at: DateTime<Utc>,
    pub item_count: usize,
}

/// Result of one fetch attempt for one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub dataset: String,
    pub success: bool,
    /// Number of observations received
    pub items: usize,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RefreshOutcome {
    pub fn fetched(dataset: &str, items: usize) -> Self {
        Self {
            dataset: dataset.to_string(),
            success: true,
            items,
            skipped: false,
            error: None,
        }
    }

    pub fn skipped(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            success: true,
            items: 0,
            skipped: true,
            error: None,
        }
    }

    pub fn failed(dataset: &str, error: impl ToString) -> Self {
        Self {
            dataset: dataset.to_string(),
            success: false,
            items: 0,
            skipped: false,
            error: Some(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_series_sorted_and_deduplicated() {
        let series = TimeSeries::from_points(vec![
            Observation { timestamp: at(3), value: 3.0 },
            Observation { timestamp: at(1), value: 1.0 },
            Observation { timestamp: at(3), value: 30.0 },
            Observation { timestamp: at(2), value: f64::NAN },
        ]);
        let stamps: Vec<_> = series.points().iter().map(|p| p.timestamp).collect();
        assert_eq!(stamps, vec![at(1), at(3)]);
        assert_eq!(series.value_at(at(3)), Some(30.0));
        assert_eq!(series.last_timestamp(), Some(at(3)));
    }

    #[test]
    fn test_merge_prefers_newer_values() {
        let old = TimeSeries::from_points(vec![
            Observation { timestamp: at(1), value: 1.0 },
            Observation { timestamp: at(2), value: 2.0 },
        ]);
        let newer = TimeSeries::from_points(vec![
            Observation { timestamp: at(2), value: 2.5 },
            Observation { timestamp: at(3), value: 3.0 },
        ]);
        let merged = old.merged_with(&newer);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.value_at(at(2)), Some(2.5));
    }

    #[test]
    fn test_rate_limit_interval() {
        let limit = RateLimit { max_calls: 4, window_secs: 2 };
        assert_eq!(limit.interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_catalog_assigns_sla_and_rejects_duplicates() {
        let slas = SlaTable::default();
        let catalog = Catalog::new(
            vec![
                DatasetDescriptor::new("GDP", FrequencyClass::Quarterly),
                DatasetDescriptor::new("DGS10", FrequencyClass::Daily),
            ],
            &slas,
        )
        .unwrap();
        assert_eq!(catalog.classes(), vec![FrequencyClass::Daily, FrequencyClass::Quarterly]);
        let gdp = catalog.for_class(FrequencyClass::Quarterly).next().unwrap();
        assert_eq!(gdp.sla, slas.sla(FrequencyClass::Quarterly));

        let err = Catalog::new(
            vec![
                DatasetDescriptor::new("GDP", FrequencyClass::Quarterly),
                DatasetDescriptor::new("GDP", FrequencyClass::Annual),
            ],
            &slas,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_catalog_from_json() {
        let json = r#"[
            {"id": "UNRATE", "frequency": "monthly", "fetch_params": {"units": "lin"}},
            {"id": "SPX", "frequency": "intraday", "requires_credential": true,
             "rate_limit": {"max_calls": 1, "window_secs": 1}}
        ]"#;
        let catalog = Catalog::from_json(json, &SlaTable::default()).unwrap();
        assert_eq!(catalog.len(), 2);
        let spx = catalog.for_class(FrequencyClass::Intraday).next().unwrap();
        assert!(spx.requires_credential);
        assert_eq!(spx.rate_limit.unwrap().max_calls, 1);
    }

    #[test]
    fn test_entry_item_count_matches_payload() {
        let mut payload = BTreeMap::new();
        payload.insert("A".to_string(), TimeSeries::default());
        payload.insert("B".to_string(), TimeSeries::default());
        let entry = FrequencyCacheEntry::new(FrequencyClass::Daily, payload, at(1));
        assert_eq!(entry.metadata().item_count, 2);
    }

    #[test]
    fn test_outcome_serialization_omits_empty_error() {
        let json = serde_json::to_string(&RefreshOutcome::skipped("A")).unwrap();
        assert!(json.contains("\"skipped\":true"));
        assert!(!json.contains("error"));
    }
}
