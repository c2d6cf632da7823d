//! Error types and the degraded-failure policy

use crate::frequency::FrequencyClass;
use std::fmt;
use tracing::warn;

/// Errors from a single call to the external fetcher
#[derive(Debug)]
pub enum FetchError {
    /// HTTP request failed
    Http(reqwest::Error),
    /// Upstream returned a non-success status
    Status(u16),
    /// Dataset requires a credential and none is configured
    MissingCredential(String),
    /// Upstream payload could not be decoded
    Decode(String),
    /// Refresh job ran out of its wall-clock budget
    DeadlineExceeded,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "HTTP error: {}", e),
            Self::Status(status) => write!(f, "upstream returned status {}", status),
            Self::MissingCredential(id) => write!(f, "no credential configured for {}", id),
            Self::Decode(msg) => write!(f, "decode error: {}", msg),
            Self::DeadlineExceeded => write!(f, "refresh deadline exceeded"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl FetchError {
    /// Whether a retry has a reasonable chance of succeeding
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Status(status) => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub enum SyncError {
    /// One dataset failed to fetch
    Fetch { dataset: String, source: FetchError },
    /// Persistence backend unreachable or failing
    StoreUnavailable(String),
    /// Response cache backend unreachable or failing
    CacheBackendUnavailable(String),
    /// Every attempted dataset in a class batch failed
    AllItemsFailed { class: FrequencyClass, failures: usize },
    Config(String),
    Serialization(serde_json::Error),
    Io(Box<std::io::Error>),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch { dataset, source } => write!(f, "Fetch failed for {}: {}", dataset, source),
            Self::StoreUnavailable(msg) => write!(f, "Store unavailable: {}", msg),
            Self::CacheBackendUnavailable(msg) => write!(f, "Cache backend unavailable: {}", msg),
            Self::AllItemsFailed { class, failures } => {
                write!(f, "All {} {} datasets failed", failures, class)
            }
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fetch { source, .. } => Some(source),
            Self::Serialization(e) => Some(e),
            Self::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// External dependency whose failures are absorbed rather than propagated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Key-value persistence behind the frequency store
    Store,
    /// Backend of the read-through response cache
    CacheBackend,
    /// Snapshot directory
    Snapshot,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store => f.write_str("store_unavailable"),
            Self::CacheBackend => f.write_str("cache_backend_unavailable"),
            Self::Snapshot => f.write_str("snapshot_failed"),
        }
    }
}

/// Absorb a failure from a degradable dependency.
///
/// Returns the value on success. On failure, logs once with the failure mode
/// and returns `None` so the caller can continue in degraded mode.
pub fn degrade<T>(mode: FailureMode, operation: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(failure_mode = %mode, operation, error = %e, "Degraded: continuing without dependency");
            None
        }
    }
}
