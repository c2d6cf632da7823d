//! Read-through response caching at the HTTP boundary
//!
//! Eligible requests are answered from the response cache when a live entry
//! exists. Otherwise the handler runs and a successful UTF-8 body is stored
//! together with its content type. Cache backend failures never fail a request.

use crate::server::SharedState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use series_cache::RequestKey;
use tracing::warn;

/// Largest response body that will be buffered for caching
const MAX_CACHED_BODY: usize = 16 * 1024 * 1024;

pub const CACHE_HEADER: &str = "x-cache";

/// What is kept per cached response
#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    body: String,
}

impl CachedResponse {
    fn into_response(self, cache_status: &'static str) -> Response {
        let mut response = Response::new(Body::from(self.body));
        let headers = response.headers_mut();
        if let Some(value) = self
            .content_type
            .and_then(|ct| HeaderValue::from_str(&ct).ok())
        {
            headers.insert(header::CONTENT_TYPE, value);
        }
        headers.insert(CACHE_HEADER, HeaderValue::from_static(cache_status));
        response
    }
}

pub async fn response_cache_middleware(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let key = RequestKey::new(
        request.method().as_str(),
        request.uri().path(),
        request.uri().query(),
    );
    if !state.responses.is_eligible(&key) {
        return next.run(request).await;
    }

    let served = state
        .responses
        .get_or_compute(&key, || async move {
            let response = next.run(request).await;
            if response.status() != StatusCode::OK {
                return Err(response);
            }

            let (parts, body) = response.into_parts();
            let content_type = parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = match axum::body::to_bytes(body, MAX_CACHED_BODY).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "Failed to buffer response for caching");
                    return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
                }
            };
            let body = String::from_utf8(bytes.to_vec())
                .map_err(|e| Response::from_parts(parts, Body::from(e.into_bytes())))?;

            serde_json::to_string(&CachedResponse { content_type, body }).map_err(|e| {
                warn!(error = %e, "Failed to encode response for caching");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })
        })
        .await;

    match served {
        Ok(served) => {
            let cache_status = if served.from_cache() { "HIT" } else { "MISS" };
            match serde_json::from_str::<CachedResponse>(&served.into_inner()) {
                Ok(cached) => cached.into_response(cache_status),
                Err(e) => {
                    warn!(error = %e, "Cached response is corrupt");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
        Err(response) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerState;
    use async_trait::async_trait;
    use axum::{middleware, routing::get, Router};
    use chrono::{DateTime, Utc};
    use series_cache::{
        Catalog, DatasetDescriptor, FetchError, Fetcher, FrequencyStore, MemoryKvStore,
        MokaBackend, Reconstitution, RefreshExecutor, ResponseCache, Scheduler, SlaTable,
        TimeSeries,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoFetcher;

    #[async_trait]
    impl Fetcher for NoFetcher {
        async fn fetch(
            &self,
            dataset: &DatasetDescriptor,
            _since: Option<DateTime<Utc>>,
        ) -> Result<TimeSeries, FetchError> {
            Err(FetchError::MissingCredential(dataset.id.clone()))
        }
    }

    fn csv_router() -> Router {
        let store = Arc::new(FrequencyStore::new(Arc::new(MemoryKvStore::new())));
        let combined = Arc::new(Reconstitution::new(store.clone()));
        let catalog = Arc::new(Catalog::new(Vec::new(), &SlaTable::default()).unwrap());
        let executor = RefreshExecutor::new(catalog, Arc::new(NoFetcher), store, combined.clone());
        let scheduler = Arc::new(Scheduler::new(Arc::new(executor), SlaTable::default()));
        let responses = Arc::new(ResponseCache::new(
            Some(Arc::new(MokaBackend::new(10))),
            Duration::from_secs(60),
            vec!["/api/export".to_string()],
        ));
        let state: SharedState = Arc::new(ServerState::new(combined, scheduler, responses));

        Router::new()
            .route(
                "/api/export",
                get(|| async {
                    (
                        [(header::CONTENT_TYPE, "text/csv")],
                        "date,value\n2024-01-01,1.5\n",
                    )
                }),
            )
            .layer(middleware::from_fn_with_state(state, response_cache_middleware))
    }

    async fn get_export(router: &Router) -> Response {
        router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/export")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_content_type_survives_cache_round() {
        let router = csv_router();

        let miss = get_export(&router).await;
        assert_eq!(miss.headers()[CACHE_HEADER], "MISS");
        assert_eq!(miss.headers()[header::CONTENT_TYPE], "text/csv");

        let hit = get_export(&router).await;
        assert_eq!(hit.status(), StatusCode::OK);
        assert_eq!(hit.headers()[CACHE_HEADER], "HIT");
        assert_eq!(hit.headers()[header::CONTENT_TYPE], "text/csv");
        let body = axum::body::to_bytes(hit.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"date,value\n2024-01-01,1.5\n");
    }
}
