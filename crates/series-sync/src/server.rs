//! HTTP server for the series sync API
//!
//! Read endpoints serve the combined view and never fail because of refresh
//! problems; job endpoints expose status and manual triggering.

use crate::middleware::response_cache_middleware;
use crate::types::{
    AlignedQuery, HealthResponse, InvalidateQuery, InvalidateResponse, RunQuery, SeriesResponse,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use series_cache::{FrequencyClass, Reconstitution, ResponseCache, Scheduler};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared state for the HTTP server
pub struct ServerState {
    pub combined: Arc<Reconstitution>,
    pub scheduler: Arc<Scheduler>,
    pub responses: Arc<ResponseCache>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(
        combined: Arc<Reconstitution>,
        scheduler: Arc<Scheduler>,
        responses: Arc<ResponseCache>,
    ) -> Self {
        Self {
            combined,
            scheduler,
            responses,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/combined", get(get_combined))
        .route("/api/combined/aligned", get(get_aligned))
        .route("/api/series/{name}", get(get_series))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{class}", get(get_job))
        .route("/api/jobs/{class}/run", post(run_job))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache", delete(invalidate_cache))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            response_cache_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let view = state.combined.combined().await;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: state.responses.stats(),
        missing: view.missing.clone(),
    })
}

async fn get_combined(State(state): State<SharedState>) -> Response {
    let view = state.combined.combined().await;
    Json(view.as_ref()).into_response()
}

async fn get_aligned(
    State(state): State<SharedState>,
    Query(query): Query<AlignedQuery>,
) -> Response {
    let view = state.combined.combined().await;
    let names = query.names();
    Json(view.aligned(names.as_deref(), query.ffill)).into_response()
}

async fn get_series(State(state): State<SharedState>, Path(name): Path<String>) -> Response {
    let view = state.combined.combined().await;
    let (Some(series), Some(frequency)) = (view.series.get(&name), view.origins.get(&name))
    else {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown series: {}", name));
    };

    Json(SeriesResponse {
        name: name.clone(),
        frequency: *frequency,
        refreshed_at: view.sources.get(frequency).map(|m| m.refreshed_at),
        series: series.clone(),
    })
    .into_response()
}

async fn list_jobs(State(state): State<SharedState>) -> Response {
    Json(state.scheduler.statuses().await).into_response()
}

async fn get_job(State(state): State<SharedState>, Path(class): Path<String>) -> Response {
    match class.parse::<FrequencyClass>() {
        Ok(class) => Json(state.scheduler.status(class).await).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn run_job(
    State(state): State<SharedState>,
    Path(class): Path<String>,
    Query(query): Query<RunQuery>,
) -> Response {
    let class = match class.parse::<FrequencyClass>() {
        Ok(class) => class,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    info!(class = %class, force = query.force, "Manual refresh requested");
    Json(state.scheduler.run_now(class, query.force).await).into_response()
}

async fn cache_stats(State(state): State<SharedState>) -> Response {
    Json(state.responses.stats()).into_response()
}

async fn invalidate_cache(
    State(state): State<SharedState>,
    Query(query): Query<InvalidateQuery>,
) -> Response {
    let pattern = query.pattern.unwrap_or_else(|| "response:*".to_string());
    let deleted = state.responses.delete_by_pattern(&pattern).await;
    info!(pattern = %pattern, deleted, "Response cache invalidated");
    Json(InvalidateResponse { pattern, deleted }).into_response()
}
