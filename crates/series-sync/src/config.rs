//! Service configuration loaded from environment variables

use crate::error::Result;
use series_cache::{FrequencyClass, MokaBackend, RateLimit, ResponseCache, SlaTable};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const HOUR: u64 = 60 * 60;

#[derive(Debug, Clone)]
pub struct ResponseCacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_entries: u64,
    /// Request paths under these prefixes are cacheable
    pub prefixes: Vec<String>,
}

impl ResponseCacheConfig {
    pub fn build(&self) -> ResponseCache {
        if !self.enabled {
            return ResponseCache::disabled();
        }
        ResponseCache::new(
            Some(Arc::new(MokaBackend::new(self.max_entries))),
            self.ttl,
            self.prefixes.clone(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub snapshot_retention_days: u32,
    pub datasets_file: PathBuf,
    pub fetcher_base_url: String,
    pub fetcher_api_key: Option<String>,
    pub slas: SlaTable,
    pub rate_limit: RateLimit,
    pub refresh_timeout: Duration,
    pub monthly_publish_window_days: u32,
    /// Scheduling period per class
    pub cadences: BTreeMap<FrequencyClass, Duration>,
    pub response_cache: ResponseCacheConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        let mut sla_overrides = BTreeMap::new();
        let mut cadences = BTreeMap::new();
        for class in FrequencyClass::ALL {
            let name = class.as_str().to_uppercase();
            if let Some(secs) = parsed(&format!("SLA_{}_SECS", name)) {
                sla_overrides.insert(class, Duration::from_secs(secs));
            }
            let cadence = parsed(&format!("SCHEDULE_{}_SECS", name))
                .map(Duration::from_secs)
                .or_else(|| default_cadence(class));
            if let Some(cadence) = cadence.filter(|c| !c.is_zero()) {
                cadences.insert(class, cadence);
            }
        }

        let prefixes = lookup("RESPONSE_CACHE_PREFIXES")
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| vec!["/api/combined".to_string(), "/api/series".to_string()]);

        Ok(Config {
            port: parse_or(&lookup, "PORT", 3005),
            cache_dir: lookup("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./cache/series")),
            snapshot_dir: lookup("SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./cache/snapshots")),
            snapshot_retention_days: parse_or(&lookup, "SNAPSHOT_RETENTION_DAYS", 30),
            datasets_file: lookup("DATASETS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./datasets.json")),
            fetcher_base_url: lookup("FETCHER_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8090".to_string()),
            fetcher_api_key: lookup("FETCHER_API_KEY").filter(|k| !k.is_empty()),
            slas: SlaTable::with_overrides(&sla_overrides)?,
            rate_limit: RateLimit {
                max_calls: parse_or(&lookup, "RATE_LIMIT_CALLS", 5u32).max(1),
                window_secs: parse_or(&lookup, "RATE_LIMIT_WINDOW_SECS", 1),
            },
            refresh_timeout: Duration::from_secs(parse_or(&lookup, "REFRESH_TIMEOUT_SECS", 300)),
            monthly_publish_window_days: parse_or(&lookup, "MONTHLY_PUBLISH_WINDOW_DAYS", 5),
            cadences,
            response_cache: ResponseCacheConfig {
                enabled: parse_or(&lookup, "RESPONSE_CACHE_ENABLED", true),
                ttl: Duration::from_secs(parse_or(&lookup, "RESPONSE_CACHE_TTL_SECS", 300)),
                max_entries: parse_or(&lookup, "RESPONSE_CACHE_MAX_ENTRIES", 10_000),
                prefixes,
            },
        })
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn default_cadence(class: FrequencyClass) -> Option<Duration> {
    match class {
        FrequencyClass::Daily => Some(Duration::from_secs(4 * HOUR)),
        FrequencyClass::Weekly => Some(Duration::from_secs(12 * HOUR)),
        FrequencyClass::Monthly | FrequencyClass::Quarterly | FrequencyClass::Annual => {
            Some(Duration::from_secs(24 * HOUR))
        }
        // Sub-daily classes refresh only when configured
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 3005);
        assert_eq!(config.cache_dir, PathBuf::from("./cache/series"));
        assert_eq!(config.snapshot_retention_days, 30);
        assert_eq!(config.rate_limit.max_calls, 5);
        assert_eq!(config.refresh_timeout, Duration::from_secs(300));
        assert_eq!(config.monthly_publish_window_days, 5);
        assert!(config.fetcher_api_key.is_none());
        assert_eq!(config.slas, SlaTable::default());
        assert_eq!(
            config.cadences[&FrequencyClass::Daily],
            Duration::from_secs(4 * HOUR)
        );
        assert!(!config.cadences.contains_key(&FrequencyClass::Realtime));
        assert!(config.response_cache.enabled);
        assert_eq!(
            config.response_cache.prefixes,
            vec!["/api/combined", "/api/series"]
        );
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("FETCHER_API_KEY", "secret"),
            ("SLA_DAILY_SECS", "7200"),
            ("SCHEDULE_INTRADAY_SECS", "600"),
            ("SCHEDULE_ANNUAL_SECS", "0"),
            ("RESPONSE_CACHE_ENABLED", "false"),
            ("RESPONSE_CACHE_PREFIXES", "/api/a, ,/api/b"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.fetcher_api_key.as_deref(), Some("secret"));
        assert_eq!(
            config.slas.sla(FrequencyClass::Daily),
            Duration::from_secs(7200)
        );
        assert_eq!(
            config.cadences[&FrequencyClass::Intraday],
            Duration::from_secs(600)
        );
        assert!(!config.cadences.contains_key(&FrequencyClass::Annual));
        assert!(!config.response_cache.enabled);
        assert!(!config.response_cache.build().stats().enabled);
        assert_eq!(config.response_cache.prefixes, vec!["/api/a", "/api/b"]);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = config_from(&[("PORT", "not-a-port"), ("RATE_LIMIT_CALLS", "0")]).unwrap();
        assert_eq!(config.port, 3005);
        assert_eq!(config.rate_limit.max_calls, 1);
    }

    #[test]
    fn test_non_monotonic_sla_rejected() {
        let result = config_from(&[("SLA_WEEKLY_SECS", "60")]);
        assert!(result.is_err());
    }
}
