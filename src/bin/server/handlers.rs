//! HTTP handlers for the cache server

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use tscache::{
    engine::CacheEngine,
    error::Error,
    maintenance,
    metadata::{self, MetadataEndpoint},
    observability::PrometheusExporter,
    orchestrator,
    query::QueryRequest,
    readahead::should_add_to_readahead,
};

// =============================================================================
// Application State
// =============================================================================

/// Shared application state
pub struct AppState {
    pub engine: CacheEngine,
    pub exporter: PrometheusExporter,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn json_body(status: u16, body: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

// =============================================================================
// Datapoint Queries
// =============================================================================

/// `POST /api/v1/datapoints/query`
pub async fn query_datapoints(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request: QueryRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Undecodable query body");
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid query: {}", e));
        }
    };

    let shadow = &state.engine.config().shadow;
    let referrer = headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok());
    let forced = headers
        .get(shadow.http_header_name.as_str())
        .is_some_and(|v| !v.is_empty());
    let admitted = should_add_to_readahead(
        forced,
        referrer,
        &shadow.referrer_blacklist,
    );

    match orchestrator::process_request(&state.engine, &request, admitted).await {
        Ok((response, _modes)) => (StatusCode::OK, Json(response)).into_response(),
        Err(Error::Backend(failure)) => {
            error!(error = %failure, "Backend query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, failure.to_string())
        }
        Err(Error::InvalidQuery(message)) => error_response(StatusCode::BAD_REQUEST, message),
        Err(e) => {
            error!(error = %e, "Query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// =============================================================================
// Metadata
// =============================================================================

async fn metadata_get(state: &AppState, endpoint: MetadataEndpoint) -> Response {
    let response = metadata::metadata_caching(&state.engine, endpoint.name, endpoint.path, None).await;
    json_body(response.status, response.body)
}

/// `GET /api/v1/metricnames`
pub async fn metric_names(State(state): State<Arc<AppState>>) -> Response {
    metadata_get(&state, metadata::METRIC_NAMES).await
}

/// `GET /api/v1/tagnames`
pub async fn tag_names(State(state): State<Arc<AppState>>) -> Response {
    metadata_get(&state, metadata::TAG_NAMES).await
}

/// `GET /api/v1/tagvalues`
pub async fn tag_values(State(state): State<Arc<AppState>>) -> Response {
    metadata_get(&state, metadata::TAG_VALUES).await
}

/// `POST /api/v1/datapoints/query/tags`
pub async fn query_tags(State(state): State<Arc<AppState>>, body: String) -> Response {
    let endpoint = metadata::META_QUERY;
    let response =
        metadata::metadata_caching(&state.engine, endpoint.name, endpoint.path, Some(&body)).await;
    json_body(response.status, response.body)
}

// =============================================================================
// Maintenance
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct FlushParams {
    orly: Option<String>,
}

/// `GET /api/maintenance/flushall?orly=yarly`
pub async fn flushall(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FlushParams>,
) -> impl IntoResponse {
    let message = maintenance::flushall(&state.engine, params.orly.as_deref()).await;
    Json(json!({ "message": message }))
}

/// `GET /version`
pub async fn version() -> &'static str {
    maintenance::VERSION
}

// =============================================================================
// Health & Metrics
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    store: String,
    store_reachable: bool,
}

/// `GET /health`
///
/// Degraded rather than unhealthy when the store is down: requests are still
/// served, straight from KairosDB.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store = state.engine.store();
    let reachable = match store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Store health check failed");
            false
        }
    };

    Json(HealthResponse {
        status: if reachable { "healthy" } else { "degraded" },
        version: maintenance::VERSION,
        store: store.store_id().to_string(),
        store_reachable: reachable,
    })
}

/// `GET /metrics`
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (body, content_type) = state.exporter.export_http();
    (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body)
}
