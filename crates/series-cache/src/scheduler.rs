//! Per-class job triggering, serialization and status

use crate::backup::SnapshotManager;
use crate::error::SyncError;
use crate::executor::{BatchStatus, RefreshExecutor, RefreshReport};
use crate::frequency::{FrequencyClass, SlaTable};
use crate::response_cache::ResponseCache;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of the most recent run of a class job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobOutcome {
    Never,
    Committed,
    Partial,
    UpToDate,
    Skipped,
    AllItemsFailed,
}

impl From<BatchStatus> for JobOutcome {
    fn from(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Committed => JobOutcome::Committed,
            BatchStatus::Partial => JobOutcome::Partial,
            BatchStatus::UpToDate => JobOutcome::UpToDate,
            BatchStatus::Skipped => JobOutcome::Skipped,
            BatchStatus::AllItemsFailed => JobOutcome::AllItemsFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub class: FrequencyClass,
    pub last_refresh: Option<DateTime<Utc>>,
    /// When the committed entry goes stale; now when nothing was ever committed
    pub next_due: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: JobOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub in_flight: bool,
}

#[derive(Debug, Clone)]
struct LastRun {
    at: DateTime<Utc>,
    outcome: JobOutcome,
    error: Option<String>,
}

pub struct Scheduler {
    executor: Arc<RefreshExecutor>,
    slas: SlaTable,
    responses: Option<Arc<ResponseCache>>,
    locks: HashMap<FrequencyClass, Mutex<()>>,
    runs: RwLock<HashMap<FrequencyClass, LastRun>>,
}

impl Scheduler {
    pub fn new(executor: Arc<RefreshExecutor>, slas: SlaTable) -> Self {
        let locks = FrequencyClass::ALL
            .iter()
            .map(|class| (*class, Mutex::new(())))
            .collect();
        Self {
            executor,
            slas,
            responses: None,
            locks,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Cached responses are dropped whenever a class commits new data
    pub fn with_response_cache(mut self, responses: Arc<ResponseCache>) -> Self {
        self.responses = Some(responses);
        self
    }

    pub async fn run_now(&self, class: FrequencyClass, force: bool) -> RefreshReport {
        self.run_now_at(class, force, Utc::now()).await
    }

    /// Refresh `class`, waiting for any in-flight refresh of the same class first.
    ///
    /// A waiter re-evaluates staleness after the lock is released, so datasets
    /// the earlier run refreshed are skipped.
    pub async fn run_now_at(
        &self,
        class: FrequencyClass,
        force: bool,
        now: DateTime<Utc>,
    ) -> RefreshReport {
        let _guard = self.locks[&class].lock().await;

        let report = self.executor.refresh_at(class, force, now).await;

        let error = match report.status {
            BatchStatus::AllItemsFailed => {
                let err = SyncError::AllItemsFailed {
                    class,
                    failures: report.failures(),
                };
                error!(class = %class, error = %err, "Refresh job failed");
                Some(err.to_string())
            }
            BatchStatus::Partial => {
                warn!(class = %class, failures = report.failures(), "Refresh job partially failed");
                None
            }
            _ => None,
        };

        self.runs.write().await.insert(
            class,
            LastRun {
                at: now,
                outcome: report.status.into(),
                error,
            },
        );

        if report.committed.is_some() {
            if let Some(responses) = &self.responses {
                responses.delete_by_pattern("response:*").await;
            }
        }

        report
    }

    pub async fn status(&self, class: FrequencyClass) -> JobStatus {
        self.status_at(class, Utc::now()).await
    }

    pub async fn status_at(&self, class: FrequencyClass, now: DateTime<Utc>) -> JobStatus {
        let last_refresh = self
            .executor
            .store()
            .metadata(class)
            .await
            .map(|meta| meta.refreshed_at);
        let next_due = match last_refresh {
            Some(at) => TimeDelta::from_std(self.slas.sla(class))
                .ok()
                .map(|sla| at + sla),
            None => Some(now),
        };
        let last_run = self.runs.read().await.get(&class).cloned();
        let in_flight = self.locks[&class].try_lock().is_err();

        JobStatus {
            class,
            last_refresh,
            next_due,
            last_run: last_run.as_ref().map(|r| r.at),
            last_outcome: last_run.as_ref().map_or(JobOutcome::Never, |r| r.outcome),
            last_error: last_run.and_then(|r| r.error),
            in_flight,
        }
    }

    pub async fn statuses(&self) -> Vec<JobStatus> {
        let mut statuses = Vec::with_capacity(FrequencyClass::ALL.len());
        for class in FrequencyClass::ALL {
            statuses.push(self.status(class).await);
        }
        statuses
    }

    /// Start one interval loop per catalogued class; classes without a cadence are not scheduled
    pub fn spawn(
        self: &Arc<Self>,
        cadences: &BTreeMap<FrequencyClass, Duration>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for class in self.executor.catalog().classes() {
            let Some(period) = cadences.get(&class).copied() else {
                warn!(class = %class, "No cadence configured, class will only refresh on demand");
                continue;
            };

            info!(class = %class, period_secs = period.as_secs(), "Scheduling refresh job");
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let report = scheduler.run_now(class, false).await;
                    info!(
                        class = %class,
                        status = ?report.status,
                        failures = report.failures(),
                        "Scheduled refresh finished"
                    );
                }
            }));
        }
        handles
    }
}

/// Prune snapshots older than `retention_days` once a day
pub fn spawn_snapshot_pruning(snapshots: Arc<SnapshotManager>, retention_days: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = snapshots.prune(retention_days).await {
                error!("Failed to prune snapshots: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combined::Reconstitution;
    use crate::error::FetchError;
    use crate::fetcher::Fetcher;
    use crate::response_cache::{Lookup, MokaBackend, RequestKey};
    use crate::store::{FrequencyStore, MemoryKvStore};
    use crate::types::{Catalog, DatasetDescriptor, Observation, RateLimit, TimeSeries};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Fetcher that tracks concurrency and can be switched to failing
    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        failing: AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(
            &self,
            _dataset: &DatasetDescriptor,
            _since: Option<DateTime<Utc>>,
        ) -> Result<TimeSeries, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.failing.load(Ordering::SeqCst) {
                return Err(FetchError::Status(503));
            }
            Ok(TimeSeries::from_points(vec![Observation {
                timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                value: 1.0,
            }]))
        }
    }

    fn scheduler(datasets: Vec<DatasetDescriptor>, fetcher: Arc<CountingFetcher>) -> Arc<Scheduler> {
        let catalog = Arc::new(Catalog::new(datasets, &SlaTable::default()).unwrap());
        let store = Arc::new(FrequencyStore::new(Arc::new(MemoryKvStore::new())));
        let combined = Arc::new(Reconstitution::new(store.clone()));
        let executor = RefreshExecutor::new(catalog, fetcher, store, combined).with_rate_limit(
            RateLimit {
                max_calls: 1000,
                window_secs: 1,
            },
        );
        Arc::new(Scheduler::new(Arc::new(executor), SlaTable::default()))
    }

    fn noon(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_status_before_first_run() {
        let s = scheduler(
            vec![DatasetDescriptor::new("DGS10", FrequencyClass::Daily)],
            Arc::new(CountingFetcher::default()),
        );
        let status = s.status_at(FrequencyClass::Daily, noon(1)).await;
        assert_eq!(status.last_outcome, JobOutcome::Never);
        assert!(status.last_refresh.is_none());
        assert_eq!(status.next_due, Some(noon(1)));
        assert!(!status.in_flight);
    }

    #[tokio::test]
    async fn test_run_now_records_status() {
        let s = scheduler(
            vec![DatasetDescriptor::new("DGS10", FrequencyClass::Daily)],
            Arc::new(CountingFetcher::default()),
        );
        let report = s.run_now_at(FrequencyClass::Daily, false, noon(2)).await;
        assert_eq!(report.status, BatchStatus::Committed);

        let status = s.status(FrequencyClass::Daily).await;
        assert_eq!(status.last_outcome, JobOutcome::Committed);
        assert_eq!(status.last_refresh, Some(noon(2)));
        assert_eq!(status.last_run, Some(noon(2)));
        assert_eq!(status.next_due, Some(noon(2) + TimeDelta::hours(6)));
    }

    #[tokio::test]
    async fn test_concurrent_runs_for_one_class_are_serialized() {
        let fetcher = Arc::new(CountingFetcher {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let s = scheduler(
            vec![
                DatasetDescriptor::new("A", FrequencyClass::Daily),
                DatasetDescriptor::new("B", FrequencyClass::Daily),
            ],
            fetcher.clone(),
        );

        let (first, second) = tokio::join!(
            s.run_now_at(FrequencyClass::Daily, false, noon(2)),
            s.run_now_at(FrequencyClass::Daily, false, noon(2)),
        );

        let mut statuses = vec![first.status, second.status];
        statuses.sort_by_key(|s| format!("{:?}", s));
        assert_eq!(statuses, vec![BatchStatus::Committed, BatchStatus::UpToDate]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fetcher.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_refetches_fresh_class() {
        let fetcher = Arc::new(CountingFetcher::default());
        let s = scheduler(
            vec![DatasetDescriptor::new("A", FrequencyClass::Daily)],
            fetcher.clone(),
        );
        s.run_now_at(FrequencyClass::Daily, false, noon(2)).await;
        let again = s.run_now_at(FrequencyClass::Daily, false, noon(2)).await;
        assert_eq!(again.status, BatchStatus::UpToDate);

        let forced = s.run_now_at(FrequencyClass::Daily, true, noon(2)).await;
        assert_eq!(forced.status, BatchStatus::Committed);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_monthly_job_skipped_outside_window() {
        let fetcher = Arc::new(CountingFetcher::default());
        let s = scheduler(
            vec![DatasetDescriptor::new("UNRATE", FrequencyClass::Monthly)],
            fetcher.clone(),
        );
        s.run_now_at(FrequencyClass::Monthly, false, noon(10)).await;

        let status = s.status(FrequencyClass::Monthly).await;
        assert_eq!(status.last_outcome, JobOutcome::Skipped);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_items_failed_surfaces_in_status_only() {
        let fetcher = Arc::new(CountingFetcher::default());
        let s = scheduler(
            vec![DatasetDescriptor::new("A", FrequencyClass::Daily)],
            fetcher.clone(),
        );
        s.run_now_at(FrequencyClass::Daily, false, noon(2)).await;

        fetcher.failing.store(true, Ordering::SeqCst);
        let report = s.run_now_at(FrequencyClass::Daily, false, noon(4)).await;
        assert_eq!(report.status, BatchStatus::AllItemsFailed);

        let status = s.status(FrequencyClass::Daily).await;
        assert_eq!(status.last_outcome, JobOutcome::AllItemsFailed);
        assert_eq!(status.last_refresh, Some(noon(2)));
        assert_eq!(status.last_run, Some(noon(4)));
        assert!(status.last_error.unwrap().contains("daily"));
    }

    #[tokio::test]
    async fn test_commit_invalidates_cached_responses() {
        let responses = Arc::new(ResponseCache::new(
            Some(Arc::new(MokaBackend::new(100))),
            Duration::from_secs(300),
            vec!["/api/".to_string()],
        ));
        let catalog = Arc::new(
            Catalog::new(
                vec![DatasetDescriptor::new("A", FrequencyClass::Weekly)],
                &SlaTable::default(),
            )
            .unwrap(),
        );
        let store = Arc::new(FrequencyStore::new(Arc::new(MemoryKvStore::new())));
        let combined = Arc::new(Reconstitution::new(store.clone()));
        let executor = RefreshExecutor::new(
            catalog,
            Arc::new(CountingFetcher::default()),
            store,
            combined,
        );
        let s = Scheduler::new(Arc::new(executor), SlaTable::default())
            .with_response_cache(responses.clone());

        let key = RequestKey::new("GET", "/api/combined", None);
        responses.store_at(&key, "stale".to_string(), noon(2)).await;
        assert!(matches!(responses.lookup_at(&key, noon(2)).await, Lookup::Hit(_)));

        s.run_now_at(FrequencyClass::Weekly, false, noon(2)).await;
        assert_eq!(responses.lookup_at(&key, noon(2)).await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_statuses_cover_every_class() {
        let s = scheduler(vec![], Arc::new(CountingFetcher::default()));
        let statuses = s.statuses().await;
        assert_eq!(statuses.len(), FrequencyClass::ALL.len());
        assert!(statuses.iter().all(|st| st.last_outcome == JobOutcome::Never));
    }
}
