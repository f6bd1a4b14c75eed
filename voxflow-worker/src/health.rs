//! HTTP health surface for the worker: `/health` with full component
//! detail, `/live` for liveness probes, and `/ready` which only passes once
//! the runtime is up and at least one provider passes its health check.

use crate::activities::Activities;
use crate::engine::Runtime;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use voxflow_providers_sdk::ProviderType;

/// Bound for each provider probe during a `/health` call.
const PROVIDER_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub connected: bool,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProviderAvailability {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub worker_id: String,
    pub task_queue: String,
    pub uptime_secs: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub engine: ComponentStatus,
    pub object_store: ComponentStatus,
    pub providers: Vec<ProviderAvailability>,
}

/// Shared state behind the health routes.
pub struct HealthState {
    pub runtime: Arc<Runtime>,
    pub activities: Arc<Activities>,
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/live", get(live))
        .route("/ready", get(ready))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(15))),
        )
        .with_state(state)
}

async fn live() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.runtime.is_running() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    // Readiness means a provider that can actually serve, not one that is
    // merely registered.
    let checks = state
        .activities
        .registry()
        .health_check_all(PROVIDER_PROBE_TIMEOUT)
        .await;
    if checks.values().any(|outcome| outcome.is_ok()) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn health(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let runtime = &state.runtime;
    let engine = ComponentStatus {
        connected: runtime.is_running(),
        endpoint: format!("inprocess://{}", runtime.task_queue()),
        error: (!runtime.is_running()).then(|| "runtime stopped".to_string()),
    };

    let store = state.activities.store();
    let object_store = match store.health_check().await {
        Ok(()) => ComponentStatus {
            connected: true,
            endpoint: store.endpoint(),
            error: None,
        },
        Err(err) => ComponentStatus {
            connected: false,
            endpoint: store.endpoint(),
            error: Some(err.to_string()),
        },
    };

    let registry = state.activities.registry();
    let checks = registry.health_check_all(PROVIDER_PROBE_TIMEOUT).await;
    let mut providers: Vec<ProviderAvailability> = registry
        .list_info()
        .into_iter()
        .map(|info| {
            let outcome = checks.get(&info.name);
            let error = outcome
                .and_then(|result| result.as_ref().err())
                .map(|err| err.to_string());
            ProviderAvailability {
                available: error.is_none(),
                name: info.name,
                provider_type: info.provider_type,
                error,
            }
        })
        .collect();
    providers.sort_by(|a, b| a.name.cmp(&b.name));

    let any_provider_available = providers.iter().any(|p| p.available);
    let all_providers_available = !providers.is_empty() && providers.iter().all(|p| p.available);
    let status = if !engine.connected || !any_provider_available {
        OverallStatus::Unhealthy
    } else if all_providers_available && object_store.connected {
        OverallStatus::Healthy
    } else {
        OverallStatus::Degraded
    };

    let code = match status {
        OverallStatus::Healthy | OverallStatus::Degraded => StatusCode::OK,
        OverallStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (
        code,
        Json(HealthReport {
            status,
            worker_id: runtime.worker_id().to_string(),
            task_queue: runtime.task_queue().to_string(),
            uptime_secs: runtime.uptime().as_secs(),
            started_at: runtime.started_at(),
            engine,
            object_store,
            providers,
        }),
    )
}
