//! Reconstitution of one combined view from the frequency-partitioned entries

use crate::frequency::FrequencyClass;
use crate::store::FrequencyStore;
use crate::types::{EntryMetadata, FrequencyCacheEntry, TimeSeries};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Union of every named series across all frequency entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedView {
    pub series: BTreeMap<String, TimeSeries>,
    /// Class that contributed each series
    pub origins: BTreeMap<String, FrequencyClass>,
    /// Metadata of every entry that was present
    pub sources: BTreeMap<FrequencyClass, EntryMetadata>,
    /// Classes with no entry at reconstruction time
    pub missing: Vec<FrequencyClass>,
}

/// Timestamp-indexed frame built from a combined view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedFrame {
    pub columns: Vec<String>,
    pub rows: Vec<AlignedRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedRow {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<Option<f64>>,
}

impl CombinedView {
    /// Merge entries into one view.
    ///
    /// When a series name appears in more than one entry the most recently
    /// refreshed entry wins; on equal refresh times the slower class wins.
    pub fn from_entries(entries: Vec<FrequencyCacheEntry>, missing: Vec<FrequencyClass>) -> Self {
        let mut ordered = entries;
        ordered.sort_by(|a, b| {
            a.refreshed_at
                .cmp(&b.refreshed_at)
                .then(a.frequency.cmp(&b.frequency))
        });

        let mut view = CombinedView {
            missing,
            ..Default::default()
        };
        for entry in ordered {
            view.sources.insert(entry.frequency, entry.metadata());
            for (name, series) in entry.payload {
                if let Some(previous) = view.origins.insert(name.clone(), entry.frequency) {
                    if previous != entry.frequency {
                        warn!(
                            series = %name,
                            kept = %entry.frequency,
                            replaced = %previous,
                            "Series present in more than one frequency entry"
                        );
                    }
                }
                view.series.insert(name, series);
            }
        }
        view.missing.sort();
        view
    }

    /// Align the selected series (all when `names` is `None`) on the union of
    /// their timestamps, optionally carrying the last value forward.
    pub fn aligned(&self, names: Option<&[String]>, forward_fill: bool) -> AlignedFrame {
        let columns: Vec<String> = match names {
            Some(names) => names
                .iter()
                .filter(|n| self.series.contains_key(n.as_str()))
                .cloned()
                .collect(),
            None => self.series.keys().cloned().collect(),
        };

        let selected: Vec<&TimeSeries> = columns.iter().map(|n| &self.series[n]).collect();
        let timestamps: BTreeSet<DateTime<Utc>> = selected
            .iter()
            .flat_map(|s| s.points().iter().map(|p| p.timestamp))
            .collect();

        let mut last: Vec<Option<f64>> = vec![None; columns.len()];
        let rows = timestamps
            .into_iter()
            .map(|timestamp| {
                let values = selected
                    .iter()
                    .enumerate()
                    .map(|(i, series)| match series.value_at(timestamp) {
                        Some(v) => {
                            last[i] = Some(v);
                            Some(v)
                        }
                        None if forward_fill => last[i],
                        None => None,
                    })
                    .collect();
                AlignedRow { timestamp, values }
            })
            .collect();

        AlignedFrame { columns, rows }
    }
}

/// Builds combined views on demand and memoizes the latest one until invalidated
pub struct Reconstitution {
    store: Arc<FrequencyStore>,
    current: RwLock<Option<Arc<CombinedView>>>,
    /// Bumped on every invalidation; a rebuild started before a bump is not memoized
    generation: AtomicU64,
}

impl Reconstitution {
    pub fn new(store: Arc<FrequencyStore>) -> Self {
        Self {
            store,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Current combined view; never fails, missing entries are reported in the view
    pub async fn combined(&self) -> Arc<CombinedView> {
        if let Some(view) = self.current.read().await.as_ref() {
            return view.clone();
        }

        let generation = self.generation.load(Ordering::Acquire);
        let view = Arc::new(self.rebuild().await);

        let mut current = self.current.write().await;
        if self.generation.load(Ordering::Acquire) == generation {
            *current = Some(view.clone());
        } else {
            debug!("Entries changed during rebuild, not memoizing view");
        }
        view
    }

    /// Drop the memoized view so the next read rebuilds it
    pub async fn invalidate(&self) {
        let mut current = self.current.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        *current = None;
        debug!("Combined view invalidated");
    }

    async fn rebuild(&self) -> CombinedView {
        let reads = FrequencyClass::ALL.iter().map(|class| {
            let store = self.store.clone();
            let class = *class;
            async move { (class, store.get(class).await) }
        });

        let mut entries = Vec::new();
        let mut missing = Vec::new();
        for (class, entry) in join_all(reads).await {
            match entry {
                Some(entry) => entries.push(entry),
                None => missing.push(class),
            }
        }

        let view = CombinedView::from_entries(entries, missing);
        debug!(
            series = view.series.len(),
            missing = view.missing.len(),
            "Rebuilt combined view"
        );
        view
    }
}
