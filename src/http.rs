pub mod panel;
pub mod render_api;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{Identity, RouteClass};
use crate::engine::Engine;
use crate::{EngineError, Result};

/// Builds the full HTTP surface over an engine.
pub fn router(engine: Arc<Engine>) -> Router {
    let base = {
        let configured = engine.settings.server.base_path.trim_end_matches('/');
        if configured.is_empty() {
            "/api/v1".to_string()
        } else {
            configured.to_string()
        }
    };
    let api = Router::new()
        .route("/tenants", get(panel::list_tenants).post(panel::create_tenant))
        .route("/tenants/{id}", get(panel::get_tenant))
        .route(
            "/tenants/{id}/workspaces",
            get(panel::list_workspaces).post(panel::create_workspace),
        )
        .route("/workspaces/{id}", get(panel::get_workspace))
        .route(
            "/workspaces/{id}/templates",
            get(panel::list_templates).post(panel::create_template),
        )
        .route(
            "/workspaces/{id}/injectables",
            get(render_api::injectable_listing).post(panel::create_workspace_injectable),
        )
        .route(
            "/workspaces/{id}/injectables/{injectable_id}",
            delete(panel::delete_workspace_injectable),
        )
        .route("/templates/{id}", get(panel::get_template))
        .route(
            "/templates/{id}/versions",
            get(panel::list_versions).post(panel::create_draft),
        )
        .route(
            "/templates/{id}/versions/{vid}",
            get(panel::get_version).put(panel::edit_version),
        )
        .route("/templates/{id}/versions/{vid}/publish", post(panel::publish_version))
        .route(
            "/templates/{id}/versions/{vid}/schedule",
            post(panel::schedule_version).delete(panel::cancel_schedule),
        )
        .route("/templates/{id}/versions/{vid}/archive", post(panel::archive_version))
        .route(
            "/templates/{id}/versions/{vid}/preview",
            post(render_api::preview),
        )
        .route(
            "/workspace/document-types/{code}/render",
            post(render_api::render_by_classification),
        )
        .route("/me/roles", get(render_api::me_roles));

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .nest(&base, api)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(engine): State<Arc<Engine>>) -> Response {
    match engine.readiness().await {
        Ok(()) => (StatusCode::OK, "ready").into_response(),
        Err(error) => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({"error": error.to_string()})),
        )
            .into_response(),
    }
}

/// Lowers a header map to the plain string map the engine works with.
pub fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Authenticates a request for the given route class.
pub async fn authenticate(
    engine: &Engine,
    route: RouteClass,
    headers: &HeaderMap,
) -> Result<Identity> {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    engine
        .authenticate(route, authorization, &header_map(headers))
        .await
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::Validation(_)
            | EngineError::DuplicateCode(_)
            | EngineError::Config(_)
            | EngineError::Catalog(_) => StatusCode::BAD_REQUEST,
            EngineError::Unauthorized(_)
            | EngineError::InvalidToken(_)
            | EngineError::TokenExpired => StatusCode::UNAUTHORIZED,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            e if e.is_conflict() => StatusCode::CONFLICT,
            EngineError::MissingInjectables(_)
            | EngineError::CircularDependency(_)
            | EngineError::CriticalInjectorFailed { .. }
            | EngineError::MappingFailed(_)
            | EngineError::CodeCollision(_)
            | EngineError::ContentValidation(_)
            | EngineError::EmptyContent => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::TypesetterTimeout => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            EngineError::TenantNotFound(_)
            | EngineError::WorkspaceNotFound(_)
            | EngineError::ClassificationNotFound(_)
            | EngineError::TemplateNotFound(_)
            | EngineError::VersionNotFound(_)
            | EngineError::InjectableNotFound(_)
            | EngineError::UserNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self {
            EngineError::MissingInjectables(codes) => {
                json!({"error": "missing required injectables", "codes": codes})
            }
            EngineError::CircularDependency(path) => {
                json!({"error": "circular injector dependency", "path": path})
            }
            EngineError::ContentValidation(report) => {
                json!({"error": "content validation failed", "validation": report})
            }
            EngineError::Busy => json!({"error": "renderer busy"}),
            // Downstream detail stays in logs, not in responses.
            EngineError::Typesetter(_) => json!({"error": "typesetter failed"}),
            EngineError::Database(_) => json!({"error": "database error"}),
            other => json!({"error": other.to_string()}),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, axum::Json(body)).into_response()
    }
}
