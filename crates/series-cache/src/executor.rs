//! Rate-limited, failure-isolating refresh of one frequency class

use crate::backup::SnapshotManager;
use crate::combined::Reconstitution;
use crate::error::{degrade, FailureMode, FetchError, SyncError};
use crate::fetcher::Fetcher;
use crate::frequency::FrequencyClass;
use crate::staleness::{is_stale, PublicationCalendar};
use crate::store::FrequencyStore;
use crate::types::{
    Catalog, DatasetDescriptor, EntryMetadata, FrequencyCacheEntry, RateLimit, RefreshOutcome,
    TimeSeries,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Overall result of one class refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchStatus {
    /// Every attempted dataset succeeded and a new entry was built
    Committed,
    /// Some datasets failed; successes were committed
    Partial,
    /// Nothing was stale, no fetch performed
    UpToDate,
    /// Publication calendar closed, no fetch performed
    Skipped,
    /// Every attempted dataset failed; the existing entry was kept
    AllItemsFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub class: FrequencyClass,
    pub started_at: DateTime<Utc>,
    pub status: BatchStatus,
    pub outcomes: Vec<RefreshOutcome>,
    /// Metadata of the new entry, present only when it was persisted
    pub committed: Option<EntryMetadata>,
}

impl RefreshReport {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }
}

/// Spaces successive external calls
struct Pacer {
    last_call: Option<Instant>,
}

impl Pacer {
    fn new() -> Self {
        Self { last_call: None }
    }

    /// Sleep until `interval` has passed since the previous call, but never past `deadline`
    async fn wait(&mut self, interval: Duration, deadline: Instant) {
        if let Some(last) = self.last_call {
            let next = last + interval;
            if next > Instant::now() {
                tokio::time::sleep_until(next.min(deadline)).await;
            }
        }
        self.last_call = Some(Instant::now());
    }
}

pub struct RefreshExecutor {
    catalog: Arc<Catalog>,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<FrequencyStore>,
    combined: Arc<Reconstitution>,
    snapshots: Option<Arc<SnapshotManager>>,
    calendar: PublicationCalendar,
    rate_limit: RateLimit,
    timeout: Duration,
}

impl RefreshExecutor {
    pub fn new(
        catalog: Arc<Catalog>,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<FrequencyStore>,
        combined: Arc<Reconstitution>,
    ) -> Self {
        Self {
            catalog,
            fetcher,
            store,
            combined,
            snapshots: None,
            calendar: PublicationCalendar::default(),
            rate_limit: RateLimit::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_calendar(mut self, calendar: PublicationCalendar) -> Self {
        self.calendar = calendar;
        self
    }

    /// Pacing applied to datasets that do not declare their own rate limit
    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Wall-clock budget for one class refresh
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotManager>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &FrequencyStore {
        &self.store
    }

    pub async fn refresh(&self, class: FrequencyClass, force: bool) -> RefreshReport {
        self.refresh_at(class, force, Utc::now()).await
    }

    /// Refresh every dataset of `class` as of `now`.
    ///
    /// Never returns an error: per-dataset failures are recorded in the
    /// outcomes and batch-level failures in the report status.
    pub async fn refresh_at(
        &self,
        class: FrequencyClass,
        force: bool,
        now: DateTime<Utc>,
    ) -> RefreshReport {
        let datasets: Vec<&DatasetDescriptor> = self.catalog.for_class(class).collect();
        let mut report = RefreshReport {
            class,
            started_at: now,
            status: BatchStatus::UpToDate,
            outcomes: Vec::with_capacity(datasets.len()),
            committed: None,
        };

        if datasets.is_empty() {
            debug!(class = %class, "No datasets configured for class");
            return report;
        }

        if !force && !self.calendar.can_fetch_now(class, now) {
            info!(class = %class, date = %now.date_naive(), "Outside publication window, skipping");
            report.status = BatchStatus::Skipped;
            report.outcomes = datasets.iter().map(|d| RefreshOutcome::skipped(&d.id)).collect();
            return report;
        }

        let existing = self.store.get(class).await;
        let deadline = Instant::now() + self.timeout;
        let mut pacer = Pacer::new();
        let mut payload: BTreeMap<String, TimeSeries> = BTreeMap::new();
        let mut attempted = 0usize;
        let mut failures = 0usize;
        let mut carried = false;

        for dataset in datasets {
            let cached = existing.as_ref().and_then(|e| e.payload.get(&dataset.id));
            let last_refresh = existing
                .as_ref()
                .filter(|_| cached.is_some())
                .map(|e| e.refreshed_at);

            if !force && !is_stale(last_refresh, dataset.sla, now) {
                if let Some(series) = cached {
                    payload.insert(dataset.id.clone(), series.clone());
                    carried = true;
                }
                report.outcomes.push(RefreshOutcome::skipped(&dataset.id));
                continue;
            }

            attempted += 1;
            match self.fetch_one(dataset, cached, &mut pacer, deadline).await {
                Ok((series, items)) => {
                    debug!(class = %class, dataset = %dataset.id, items, "Fetched dataset");
                    payload.insert(dataset.id.clone(), series);
                    report.outcomes.push(RefreshOutcome::fetched(&dataset.id, items));
                }
                Err(e) => {
                    failures += 1;
                    let err = SyncError::Fetch {
                        dataset: dataset.id.clone(),
                        source: e,
                    };
                    warn!(class = %class, error = %err, "Dataset refresh failed, continuing");
                    report.outcomes.push(RefreshOutcome::failed(&dataset.id, &err));
                }
            }
        }

        if attempted == 0 {
            debug!(class = %class, "All datasets fresh");
            return report;
        }

        if failures == attempted {
            let err = SyncError::AllItemsFailed { class, failures };
            error!(class = %class, error = %err, "Keeping existing entry");
            report.status = BatchStatus::AllItemsFailed;
            return report;
        }

        report.status = if failures > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Committed
        };

        // Carried series were not refetched, so the entry keeps their older refresh time
        let refreshed_at = match &existing {
            Some(previous) if carried => previous.refreshed_at.min(now),
            _ => now,
        };
        let entry = FrequencyCacheEntry::new(class, payload, refreshed_at);
        if degrade(FailureMode::Store, "frequency_put", self.store.put(&entry).await).is_some() {
            report.committed = Some(entry.metadata());
            self.combined.invalidate().await;
        }
        self.snapshot_in_background(entry);

        info!(
            class = %class,
            attempted,
            failures,
            status = ?report.status,
            "Refresh finished"
        );
        report
    }

    async fn fetch_one(
        &self,
        dataset: &DatasetDescriptor,
        cached: Option<&TimeSeries>,
        pacer: &mut Pacer,
        deadline: Instant,
    ) -> Result<(TimeSeries, usize), FetchError> {
        if Instant::now() >= deadline {
            return Err(FetchError::DeadlineExceeded);
        }

        let interval = dataset.rate_limit.unwrap_or(self.rate_limit).interval();
        pacer.wait(interval, deadline).await;

        // Re-read a window of one SLA so upstream revisions are picked up
        let overlap = TimeDelta::from_std(dataset.sla).unwrap_or_else(|_| TimeDelta::zero());
        let since = cached.and_then(|s| s.last_timestamp()).map(|t| t - overlap);

        let fresh = tokio::time::timeout_at(deadline, self.fetcher.fetch(dataset, since))
            .await
            .unwrap_or(Err(FetchError::DeadlineExceeded))?;

        let items = fresh.len();
        let series = match cached {
            Some(previous) => previous.merged_with(&fresh),
            None => fresh,
        };
        Ok((series, items))
    }

    fn snapshot_in_background(&self, entry: FrequencyCacheEntry) {
        if let Some(snapshots) = &self.snapshots {
            let snapshots = snapshots.clone();
            tokio::spawn(async move {
                let label = format!("frequency-{}", entry.frequency);
                degrade(
                    FailureMode::Snapshot,
                    "snapshot",
                    snapshots.snapshot_at(&entry, &label, entry.refreshed_at).await,
                );
            });
        }
    }
}
