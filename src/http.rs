use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use crate::engine::{EngineError, SyncEngine};
use crate::model::SourceSystem;
use crate::observability::MetricsRegistry;
use crate::state::{HealthStatus, SyncStateManager};

/// Application state passed to handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
	pub engine: Arc<SyncEngine>,
	pub state: Arc<SyncStateManager>,
	pub metrics: Arc<MetricsRegistry>,
}

/// Operational HTTP surface: health, metrics, and a manual sync trigger.
pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(health_handler))
		.route("/metrics", get(metrics_handler))
		.route("/sync/trigger", post(trigger_handler))
		.with_state(state)
}

/// Health endpoint: 200 with the health report unless the hub is critical,
/// then 503 so load balancers and probes notice.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
	let report = state.state.health();
	let code = match report.status {
		HealthStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
		_ => StatusCode::OK,
	};
	(code, Json(report)).into_response()
}

/// Prometheus metrics endpoint: returns metrics in Prometheus text format
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
	let metrics_text = state.metrics.encode();
	(StatusCode::OK, metrics_text).into_response()
}

#[derive(Debug, Deserialize)]
struct TriggerParams {
	source: String,
	target: Option<String>,
	entity_id: Option<String>,
}

async fn trigger_handler(
	State(state): State<AppState>,
	Query(params): Query<TriggerParams>,
) -> impl IntoResponse {
	let Ok(source) = params.source.parse::<SourceSystem>() else {
		return (
			StatusCode::BAD_REQUEST,
			format!("unknown source system: {}", params.source),
		)
			.into_response();
	};
	let target = match params.target.as_deref().map(str::parse::<SourceSystem>) {
		None => None,
		Some(Ok(system)) => Some(system),
		Some(Err(e)) => return (StatusCode::BAD_REQUEST, e).into_response(),
	};

	match state
		.engine
		.trigger_sync(source, target, params.entity_id.as_deref())
		.await
	{
		Ok(ids) => (StatusCode::ACCEPTED, Json(ids)).into_response(),
		Err(e @ EngineError::NotStarted) => {
			(StatusCode::CONFLICT, e.to_string()).into_response()
		}
		Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
	}
}
