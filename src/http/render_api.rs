use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Response, StatusCode, header};
use axum::response::IntoResponse;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::RouteClass;
use crate::engine::Engine;
use crate::http::authenticate;
use crate::render::RenderOutput;
use crate::store::{
    MembershipStore, TemplateStore, TenantStore, UserStore, VersionStore, WorkspaceStore,
};
use crate::tenancy::Workspace;
use crate::{EngineError, Result};

/// Workspace addressing headers on the production render route.
const TENANT_HEADER: &str = "x-tenant-code";
const WORKSPACE_HEADER: &str = "x-workspace-code";

#[derive(Debug, Deserialize, Default)]
pub struct LocaleQuery {
    #[serde(default)]
    pub locale: Option<String>,
}

fn locale_of(query: &LocaleQuery, headers: &HeaderMap) -> String {
    if let Some(locale) = &query.locale {
        return locale.clone();
    }
    headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|tag| tag.split(';').next().unwrap_or(tag).trim().to_string())
        .filter(|tag| !tag.is_empty())
        .unwrap_or_else(|| "en".to_string())
}

async fn workspace_from_headers(engine: &Engine, headers: &HeaderMap) -> Result<Workspace> {
    let tenant_code = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            EngineError::Validation(format!("missing `{TENANT_HEADER}` header"))
        })?;
    let workspace_code = headers
        .get(WORKSPACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            EngineError::Validation(format!("missing `{WORKSPACE_HEADER}` header"))
        })?;
    let tenant = engine
        .stores()
        .tenants
        .by_code(tenant_code)
        .await?
        .ok_or_else(|| EngineError::TenantNotFound(tenant_code.to_string()))?;
    engine
        .stores()
        .workspaces
        .by_code(Some(tenant.id), workspace_code)
        .await?
        .ok_or_else(|| EngineError::WorkspaceNotFound(workspace_code.to_string()))
}

fn pdf_response(output: RenderOutput) -> Result<Response<Body>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/pdf")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", output.filename),
        )
        .header("X-Page-Count", output.page_count.to_string())
        .body(Body::from(output.pdf))
        .map_err(|e| EngineError::Internal(e.to_string()))
}

/// Production render addressed by document classification code.
pub async fn render_by_classification(
    State(engine): State<Arc<Engine>>,
    Path(code): Path<String>,
    Query(query): Query<LocaleQuery>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Render, &headers).await?;
    let workspace = workspace_from_headers(&engine, &headers).await?;
    let (template, version) = engine.production_target(&workspace, &code).await?;
    let output = engine
        .render(
            &workspace,
            &template,
            &version,
            Some(code),
            false,
            body,
            crate::http::header_map(&headers),
            Some(identity),
            locale_of(&query, &headers),
        )
        .await?;
    pdf_response(output)
}

/// Editor preview render of a specific version; accepts drafts and
/// scheduled versions.
pub async fn preview(
    State(engine): State<Arc<Engine>>,
    Path((id, vid)): Path<(Uuid, Uuid)>,
    Query(query): Query<LocaleQuery>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let template = engine
        .stores()
        .templates
        .get(id)
        .await?
        .ok_or_else(|| EngineError::TemplateNotFound(id.to_string()))?;
    let version = engine
        .stores()
        .versions
        .get(vid)
        .await?
        .filter(|v| v.template_id == id)
        .ok_or_else(|| EngineError::VersionNotFound(vid.to_string()))?;
    let workspace = engine
        .stores()
        .workspaces
        .get(template.workspace_id)
        .await?
        .ok_or_else(|| EngineError::WorkspaceNotFound(template.workspace_id.to_string()))?;
    let output = engine
        .render(
            &workspace,
            &template,
            &version,
            None,
            true,
            body,
            crate::http::header_map(&headers),
            Some(identity),
            locale_of(&query, &headers),
        )
        .await?;
    pdf_response(output)
}

/// The merged injectable palette for the editor.
pub async fn injectable_listing(
    State(engine): State<Arc<Engine>>,
    Path(workspace_id): Path<Uuid>,
    Query(query): Query<LocaleQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    authenticate(&engine, RouteClass::Panel, &headers).await?;
    let workspace = engine
        .stores()
        .workspaces
        .get(workspace_id)
        .await?
        .ok_or_else(|| EngineError::WorkspaceNotFound(workspace_id.to_string()))?;
    let locale = locale_of(&query, &headers);
    Ok(Json(engine.injectable_listing(&workspace, &locale).await?))
}

/// The current user's role assignments across the system.
pub async fn me_roles(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let user_id = identity
        .user_id
        .ok_or_else(|| EngineError::Unauthorized("no user behind identity".to_string()))?;
    let user = engine
        .stores()
        .users
        .get(user_id)
        .await?
        .ok_or_else(|| EngineError::UserNotFound(user_id.to_string()))?;
    let (workspace_roles, tenant_roles) = engine
        .stores()
        .memberships
        .memberships_for_user(user_id)
        .await?;
    Ok(Json(serde_json::json!({
        "user_id": user.id,
        "email": user.email,
        "system_role": user.system_role,
        "tenant_roles": tenant_roles,
        "workspace_roles": workspace_roles,
    })))
}
