//! External time-series fetcher capability and its HTTP implementation

use crate::error::FetchError;
use crate::types::{DatasetDescriptor, Observation, TimeSeries};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Source of time series for a dataset.
///
/// Implementations must tolerate repeated calls for the same dataset.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch observations for `dataset`, starting at `since` when given
    async fn fetch(
        &self,
        dataset: &DatasetDescriptor,
        since: Option<DateTime<Utc>>,
    ) -> Result<TimeSeries, FetchError>;
}

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    observations: Vec<RawObservation>,
}

#[derive(Debug, Deserialize)]
struct RawObservation {
    date: String,
    value: serde_json::Value,
}

/// Fetcher for a JSON series API: `GET {base}/series/{id}?since=...`
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl HttpFetcher {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, FetchError> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(30))
    }

    pub fn with_timeout(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            api_key,
            max_attempts: MAX_ATTEMPTS,
            retry_delay: INITIAL_RETRY_DELAY,
        })
    }

    /// Attempts per dataset and the first backoff delay, doubled on each retry
    pub fn with_retry(mut self, max_attempts: u32, initial_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = initial_delay;
        self
    }

    fn build_url(
        &self,
        dataset: &DatasetDescriptor,
        since: Option<DateTime<Utc>>,
    ) -> Result<url::Url, FetchError> {
        let mut url = url::Url::parse(&self.base_url)
            .map_err(|e| FetchError::Decode(format!("invalid fetcher URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| FetchError::Decode("fetcher URL cannot be a base".to_string()))?
            .pop_if_empty()
            .push("series")
            .push(&dataset.id);

        {
            let mut query = url.query_pairs_mut();
            if let Some(since) = since {
                query.append_pair("since", &since.to_rfc3339_opts(SecondsFormat::Secs, true));
            }
            for (key, value) in &dataset.fetch_params {
                query.append_pair(key, value);
            }
            if dataset.requires_credential {
                let key = self
                    .api_key
                    .as_deref()
                    .ok_or_else(|| FetchError::MissingCredential(dataset.id.clone()))?;
                query.append_pair("api_key", key);
            }
        }
        Ok(url)
    }

    async fn fetch_once(&self, url: &url::Url) -> Result<TimeSeries, FetchError> {
        let response = self.client.get(url.clone()).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let body: SeriesResponse = response.json().await?;
        parse_observations(body.observations)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        dataset: &DatasetDescriptor,
        since: Option<DateTime<Utc>>,
    ) -> Result<TimeSeries, FetchError> {
        let url = self.build_url(dataset, since)?;
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(dataset = %dataset.id, attempt, "Fetching series");
            match self.fetch_once(&url).await {
                Ok(series) => return Ok(series),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.retry_delay * 2u32.pow(attempt - 1);
                    warn!(
                        dataset = %dataset.id,
                        error = %e,
                        "Transient fetch error, retrying in {:?} (attempt {}/{})",
                        delay,
                        attempt,
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC)
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Values arrive as numbers or numeric strings; placeholders like "." are skipped
fn parse_value(raw: &serde_json::Value) -> Option<f64> {
    match raw {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn parse_observations(raw: Vec<RawObservation>) -> Result<TimeSeries, FetchError> {
    let mut points = Vec::with_capacity(raw.len());
    for obs in raw {
        let timestamp = parse_timestamp(&obs.date)
            .ok_or_else(|| FetchError::Decode(format!("invalid date '{}'", obs.date)))?;
        if let Some(value) = parse_value(&obs.value) {
            points.push(Observation { timestamp, value });
        }
    }
    Ok(TimeSeries::from_points(points))
}
