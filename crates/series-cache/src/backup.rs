//! Timestamped snapshots of committed payloads and age-based pruning

use crate::error::Result;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

pub struct SnapshotManager {
    dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        info!(dir = ?self.dir, "Snapshot directory initialized");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn snapshot(&self, payload: &impl Serialize, label: &str) -> Result<PathBuf> {
        self.snapshot_at(payload, label, Utc::now()).await
    }

    /// Write `payload` as `{label}_{stamp}.json`; existing snapshots are never overwritten
    pub async fn snapshot_at(
        &self,
        payload: &impl Serialize,
        label: &str,
        at: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let bytes = serde_json::to_vec_pretty(payload)?;
        let base = format!("{}_{}", sanitize(label), at.format(STAMP_FORMAT));

        let mut path = self.dir.join(format!("{}.json", base));
        let mut suffix = 1;
        while fs::try_exists(&path).await? {
            path = self.dir.join(format!("{}.{}.json", base, suffix));
            suffix += 1;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        debug!(path = ?path, size = bytes.len(), "Wrote snapshot");
        Ok(path)
    }

    pub async fn prune(&self, max_age_days: u32) -> Result<usize> {
        self.prune_at(max_age_days, Utc::now()).await
    }

    /// Delete snapshots taken more than `max_age_days` before `now`
    pub async fn prune_at(&self, max_age_days: u32, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - TimeDelta::days(i64::from(max_age_days));
        let mut removed = 0;

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(taken_at) = snapshot_time(&name) else {
                continue;
            };
            if taken_at < cutoff {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(file = %name, error = %e, "Failed to prune snapshot"),
                }
            }
        }

        if removed > 0 {
            info!(removed, max_age_days, "Pruned snapshots");
        }
        Ok(removed)
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Timestamp embedded in a snapshot file name, if it is one
fn snapshot_time(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(".json")?;
    let (_, rest) = stem.rsplit_once('_')?;
    let stamp = rest.split('.').next()?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}
