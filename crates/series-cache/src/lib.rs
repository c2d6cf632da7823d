//! Freshness-aware synchronization of external time series
//!
//! Datasets are grouped by publication frequency. Each class is refreshed on
//! its own schedule, only overdue datasets are fetched, and the results are
//! stored as one entry per class. Readers get a combined view merged from
//! whatever entries exist. A separate read-through cache memoizes computed
//! responses by request shape.

mod backup;
mod combined;
mod error;
mod executor;
mod fetcher;
mod frequency;
mod response_cache;
mod scheduler;
mod staleness;
mod store;
mod types;

pub use backup::SnapshotManager;
pub use combined::{AlignedFrame, AlignedRow, CombinedView, Reconstitution};
pub use error::{degrade, FailureMode, FetchError, Result, SyncError};
pub use executor::{BatchStatus, RefreshExecutor, RefreshReport};
pub use fetcher::{Fetcher, HttpFetcher};
pub use frequency::{FrequencyClass, SlaTable};
pub use response_cache::{
    CacheBackend, CacheStats, Lookup, MokaBackend, RequestKey, ResponseCache, ResponseCacheEntry,
    Served,
};
pub use scheduler::{spawn_snapshot_pruning, JobOutcome, JobStatus, Scheduler};
pub use staleness::{is_stale, PublicationCalendar};
pub use store::{FileKvStore, FrequencyStore, KvStore, MemoryKvStore};
pub use types::{
    Catalog, DatasetDescriptor, EntryMetadata, FrequencyCacheEntry, Observation, RateLimit,
    RefreshOutcome, TimeSeries,
};
