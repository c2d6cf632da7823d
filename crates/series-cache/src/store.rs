//! Durable key-value persistence and the frequency-partitioned store on top of it

use crate::error::{degrade, FailureMode, Result, SyncError};
use crate::frequency::FrequencyClass;
use crate::types::{EntryMetadata, FrequencyCacheEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Byte-blob store with atomic per-key overwrite
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// One file per key; writes go to a temp file that is renamed into place
pub struct FileKvStore {
    dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl FileKvStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            tmp_seq: AtomicU64::new(0),
        }
    }

    /// Ensure the store directory exists
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await.map_err(unavailable)?;
        info!(dir = ?self.dir, "Key-value store initialized");
        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

fn unavailable(e: std::io::Error) -> SyncError {
    SyncError::StoreUnavailable(e.to_string())
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.tmp-{}-{}", std::process::id(), seq));

        if let Err(e) = fs::write(&tmp, value).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(unavailable(e));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(unavailable(e));
        }
        debug!(key, size = value.len(), "Stored value");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }
}

/// In-memory store, used for tests and ephemeral deployments
#[derive(Default)]
pub struct MemoryKvStore {
    values: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// One cache entry per frequency class, with an in-memory metadata index
pub struct FrequencyStore {
    backend: Arc<dyn KvStore>,
    metadata: RwLock<HashMap<FrequencyClass, EntryMetadata>>,
}

impl FrequencyStore {
    pub fn new(backend: Arc<dyn KvStore>) -> Self {
        Self {
            backend,
            metadata: RwLock::new(HashMap::new()),
        }
    }

    fn key(class: FrequencyClass) -> String {
        format!("frequency-{}", class)
    }

    /// Current entry for `class`; an unavailable or corrupt store reads as a miss
    pub async fn get(&self, class: FrequencyClass) -> Option<FrequencyCacheEntry> {
        let bytes = degrade(
            FailureMode::Store,
            "frequency_get",
            self.backend.get(&Self::key(class)).await,
        )??;

        match serde_json::from_slice::<FrequencyCacheEntry>(&bytes) {
            Ok(entry) if entry.frequency == class => {
                // A slow read must not replace metadata recorded by a newer put
                self.metadata
                    .write()
                    .await
                    .entry(class)
                    .or_insert_with(|| entry.metadata());
                Some(entry)
            }
            Ok(entry) => {
                warn!(class = %class, found = %entry.frequency, "Stored entry has wrong class, ignoring");
                None
            }
            Err(e) => {
                warn!(class = %class, error = %e, "Stored entry is corrupt, treating as miss");
                None
            }
        }
    }

    /// Replace the entry for its class in one atomic write
    pub async fn put(&self, entry: &FrequencyCacheEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry)?;
        self.backend.put(&Self::key(entry.frequency), &bytes).await?;
        self.metadata
            .write()
            .await
            .insert(entry.frequency, entry.metadata());
        info!(
            class = %entry.frequency,
            items = entry.item_count,
            refreshed_at = %entry.refreshed_at,
            "Committed frequency entry"
        );
        Ok(())
    }

    /// Refresh time and item count, without decoding the payload once indexed
    pub async fn metadata(&self, class: FrequencyClass) -> Option<EntryMetadata> {
        if let Some(meta) = self.metadata.read().await.get(&class).copied() {
            return Some(meta);
        }
        self.get(class).await.map(|entry| entry.metadata())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Observation, TimeSeries};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn entry(class: FrequencyClass, names: &[&str]) -> FrequencyCacheEntry {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let payload: BTreeMap<String, TimeSeries> = names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    TimeSeries::from_points(vec![Observation { timestamp: ts, value: 1.0 }]),
                )
            })
            .collect();
        FrequencyCacheEntry::new(class, payload, ts)
    }

    /// Store that can be switched into a failing state
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryKvStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(SyncError::StoreUnavailable("connection refused".into()));
            }
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(SyncError::StoreUnavailable("connection refused".into()));
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_missing_key() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::new(dir.path().to_path_buf());
        store.init().await.unwrap();

        assert!(store.get("absent").await.unwrap().is_none());
        store.put("frequency-daily", b"{}").await.unwrap();
        assert_eq!(store.get("frequency-daily").await.unwrap().unwrap(), b"{}");

        store.delete("frequency-daily").await.unwrap();
        assert!(store.get("frequency-daily").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::new(dir.path().to_path_buf());
        store.init().await.unwrap();
        store.put("k", b"one").await.unwrap();
        store.put("k", b"two").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["k.json".to_string()]);
        assert_eq!(store.get("k").await.unwrap().unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_file_store_unavailable_directory() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::new(dir.path().join("missing"));
        let err = store.put("k", b"v").await.unwrap_err();
        assert!(matches!(err, SyncError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_frequency_store_put_get_metadata() {
        let store = FrequencyStore::new(Arc::new(MemoryKvStore::new()));
        assert!(store.get(FrequencyClass::Daily).await.is_none());
        assert!(store.metadata(FrequencyClass::Daily).await.is_none());

        let e = entry(FrequencyClass::Daily, &["DGS10", "DEXUSEU"]);
        store.put(&e).await.unwrap();

        assert_eq!(store.get(FrequencyClass::Daily).await.unwrap(), e);
        let meta = store.metadata(FrequencyClass::Daily).await.unwrap();
        assert_eq!(meta.item_count, 2);
        assert_eq!(meta.refreshed_at, e.refreshed_at);
    }

    #[tokio::test]
    async fn test_metadata_loaded_from_backend_on_cold_index() {
        let backend = Arc::new(MemoryKvStore::new());
        FrequencyStore::new(backend.clone())
            .put(&entry(FrequencyClass::Weekly, &["ICSA"]))
            .await
            .unwrap();

        let fresh = FrequencyStore::new(backend);
        assert_eq!(fresh.metadata(FrequencyClass::Weekly).await.unwrap().item_count, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_degrades() {
        let backend = Arc::new(FlakyStore::default());
        let store = FrequencyStore::new(backend.clone());
        store.put(&entry(FrequencyClass::Monthly, &["UNRATE"])).await.unwrap();

        backend.down.store(true, Ordering::SeqCst);
        let fresh = FrequencyStore::new(backend.clone());
        assert!(fresh.get(FrequencyClass::Monthly).await.is_none());

        let err = fresh
            .put(&entry(FrequencyClass::Monthly, &["UNRATE"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_corrupt_entry_reads_as_miss() {
        let backend = Arc::new(MemoryKvStore::new());
        backend.put("frequency-annual", b"not json").await.unwrap();
        let store = FrequencyStore::new(backend);
        assert!(store.get(FrequencyClass::Annual).await.is_none());
    }
}
