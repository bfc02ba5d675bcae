use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{Identity, RouteClass};
use crate::content::ContentStructure;
use crate::engine::Engine;
use crate::http::authenticate;
use crate::injectable::{LocaleMap, WorkspaceInjectable, validate_workspace_key};
use crate::lifecycle::VersionEdit;
use crate::store::{
    ClassificationStore, MembershipStore, TemplateStore, TenantStore, UserStore, VersionStore,
    WorkspaceInjectableStore, WorkspaceStore,
};
use crate::template::Template;
use crate::tenancy::{
    AccessEntityType, Tenant, TenantStatus, Workspace, WorkspaceRole, WorkspaceStatus,
    WorkspaceType, validate_tenant_code,
};
use crate::{EngineError, Result};

/// Panel mutations require EDITOR or better in the workspace; platform
/// roles bypass membership.
async fn require_editor(engine: &Engine, identity: &Identity, workspace_id: Uuid) -> Result<()> {
    let Some(user_id) = identity.user_id else {
        return Err(EngineError::Forbidden("no user behind identity".to_string()));
    };
    if let Some(user) = engine.stores().users.get(user_id).await? {
        if user.system_role.is_some() {
            return Ok(());
        }
    }
    let (workspace_members, _) = engine.stores().memberships.memberships_for_user(user_id).await?;
    let allowed = workspace_members
        .iter()
        .any(|m| m.workspace_id == workspace_id && m.role.at_least(WorkspaceRole::Editor));
    if allowed {
        Ok(())
    } else {
        Err(EngineError::Forbidden(
            "requires EDITOR role in this workspace".to_string(),
        ))
    }
}

async fn load_workspace(engine: &Engine, id: Uuid) -> Result<Workspace> {
    engine
        .stores()
        .workspaces
        .get(id)
        .await?
        .ok_or_else(|| EngineError::WorkspaceNotFound(id.to_string()))
}

async fn load_template(engine: &Engine, id: Uuid) -> Result<Template> {
    engine
        .stores()
        .templates
        .get(id)
        .await?
        .filter(|t| t.deleted_at.is_none())
        .ok_or_else(|| EngineError::TemplateNotFound(id.to_string()))
}

pub async fn list_tenants(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    authenticate(&engine, RouteClass::Panel, &headers).await?;
    Ok(Json(engine.stores().tenants.list().await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateTenant {
    pub code: String,
    pub name: String,
}

pub async fn create_tenant(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    Json(body): Json<CreateTenant>,
) -> Result<impl IntoResponse> {
    authenticate(&engine, RouteClass::Panel, &headers).await?;
    validate_tenant_code(&body.code)?;
    if engine.stores().tenants.by_code(&body.code).await?.is_some() {
        return Err(EngineError::Validation(format!(
            "tenant code `{}` already exists",
            body.code
        )));
    }
    let now = Utc::now();
    let tenant = Tenant {
        id: Uuid::new_v4(),
        code: body.code,
        name: body.name,
        status: TenantStatus::Active,
        is_system: false,
        created_at: now,
        updated_at: now,
    };
    engine.stores().tenants.insert(&tenant).await?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

pub async fn get_tenant(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let tenant = engine
        .stores()
        .tenants
        .get(id)
        .await?
        .ok_or_else(|| EngineError::TenantNotFound(id.to_string()))?;
    if let Some(user_id) = identity.user_id {
        engine
            .record_access(user_id, AccessEntityType::Tenant, tenant.id)
            .await?;
    }
    Ok(Json(tenant))
}

pub async fn list_workspaces(
    State(engine): State<Arc<Engine>>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    authenticate(&engine, RouteClass::Panel, &headers).await?;
    Ok(Json(
        engine
            .stores()
            .workspaces
            .list_for_tenant(Some(tenant_id))
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkspace {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub system: bool,
}

pub async fn create_workspace(
    State(engine): State<Arc<Engine>>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<CreateWorkspace>,
) -> Result<impl IntoResponse> {
    authenticate(&engine, RouteClass::Panel, &headers).await?;
    validate_tenant_code(&body.code)?;
    engine
        .stores()
        .tenants
        .get(tenant_id)
        .await?
        .ok_or_else(|| EngineError::TenantNotFound(tenant_id.to_string()))?;
    if engine
        .stores()
        .workspaces
        .by_code(Some(tenant_id), &body.code)
        .await?
        .is_some()
    {
        return Err(EngineError::Validation(format!(
            "workspace code `{}` already exists in tenant",
            body.code
        )));
    }
    let workspace_type = if body.system {
        // Exactly one SYSTEM workspace per tenant.
        let existing = engine
            .stores()
            .workspaces
            .list_for_tenant(Some(tenant_id))
            .await?;
        if existing
            .iter()
            .any(|w| w.workspace_type == WorkspaceType::System)
        {
            return Err(EngineError::Validation(
                "tenant already has a SYSTEM workspace".to_string(),
            ));
        }
        WorkspaceType::System
    } else {
        WorkspaceType::Client
    };
    let now = Utc::now();
    let workspace = Workspace {
        id: Uuid::new_v4(),
        tenant_id: Some(tenant_id),
        code: body.code,
        name: body.name,
        workspace_type,
        status: WorkspaceStatus::Active,
        created_at: now,
        updated_at: now,
    };
    engine.stores().workspaces.insert(&workspace).await?;
    Ok((StatusCode::CREATED, Json(workspace)))
}

pub async fn get_workspace(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let workspace = load_workspace(&engine, id).await?;
    if let Some(user_id) = identity.user_id {
        engine
            .record_access(user_id, AccessEntityType::Workspace, workspace.id)
            .await?;
    }
    Ok(Json(workspace))
}

pub async fn list_templates(
    State(engine): State<Arc<Engine>>,
    Path(workspace_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    authenticate(&engine, RouteClass::Panel, &headers).await?;
    load_workspace(&engine, workspace_id).await?;
    Ok(Json(
        engine
            .stores()
            .templates
            .list_for_workspace(workspace_id)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub classification_code: Option<String>,
    #[serde(default)]
    pub folder_id: Option<Uuid>,
}

pub async fn create_template(
    State(engine): State<Arc<Engine>>,
    Path(workspace_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<CreateTemplate>,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let workspace = load_workspace(&engine, workspace_id).await?;
    require_editor(&engine, &identity, workspace.id).await?;

    let classification_id = match body.classification_code {
        Some(code) => {
            let tenant_id = workspace.tenant_id.ok_or_else(|| {
                EngineError::Validation(
                    "the global workspace cannot classify templates".to_string(),
                )
            })?;
            let classification = engine
                .stores()
                .classifications
                .by_code(tenant_id, &code)
                .await?
                .ok_or(EngineError::ClassificationNotFound(code))?;
            Some(classification.id)
        }
        None => None,
    };
    if body.name.trim().is_empty() {
        return Err(EngineError::Validation("template name is required".to_string()));
    }
    let now = Utc::now();
    let template = Template {
        id: Uuid::new_v4(),
        workspace_id,
        folder_id: body.folder_id,
        classification_id,
        name: body.name,
        description: body.description,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    };
    engine.stores().templates.insert(&template).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn get_template(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    authenticate(&engine, RouteClass::Panel, &headers).await?;
    Ok(Json(load_template(&engine, id).await?))
}

pub async fn list_versions(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    authenticate(&engine, RouteClass::Panel, &headers).await?;
    load_template(&engine, id).await?;
    Ok(Json(engine.stores().versions.list_for_template(id).await?))
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateDraft {
    #[serde(default)]
    pub base_version_id: Option<Uuid>,
}

pub async fn create_draft(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<CreateDraft>>,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let template = load_template(&engine, id).await?;
    require_editor(&engine, &identity, template.workspace_id).await?;
    let base = body.and_then(|Json(b)| b.base_version_id);
    let version = engine
        .lifecycle()
        .create_draft(template.id, base, identity.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(version)))
}

async fn version_of_template(
    engine: &Engine,
    template_id: Uuid,
    version_id: Uuid,
) -> Result<(Template, crate::template::TemplateVersion)> {
    let template = load_template(engine, template_id).await?;
    let version = engine
        .stores()
        .versions
        .get(version_id)
        .await?
        .filter(|v| v.template_id == template_id)
        .ok_or_else(|| EngineError::VersionNotFound(version_id.to_string()))?;
    Ok((template, version))
}

pub async fn get_version(
    State(engine): State<Arc<Engine>>,
    Path((id, vid)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    authenticate(&engine, RouteClass::Panel, &headers).await?;
    let (_, version) = version_of_template(&engine, id, vid).await?;
    Ok(Json(version))
}

#[derive(Debug, Deserialize)]
pub struct EditVersionBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Option<ContentStructure>,
}

pub async fn edit_version(
    State(engine): State<Arc<Engine>>,
    Path((id, vid)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    Json(body): Json<EditVersionBody>,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let (template, _) = version_of_template(&engine, id, vid).await?;
    require_editor(&engine, &identity, template.workspace_id).await?;
    let version = engine
        .lifecycle()
        .edit(
            vid,
            VersionEdit {
                name: body.name,
                content: body.content,
            },
        )
        .await?;
    Ok(Json(version))
}

pub async fn publish_version(
    State(engine): State<Arc<Engine>>,
    Path((id, vid)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let (template, _) = version_of_template(&engine, id, vid).await?;
    require_editor(&engine, &identity, template.workspace_id).await?;
    let outcome = engine.lifecycle().publish(vid).await?;
    engine.pipeline().invalidate_version(outcome.published.id);
    Ok(Json(serde_json::json!({
        "published": outcome.published,
        "archived": outcome.archived,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ScheduleBody {
    pub scheduled_at: DateTime<Utc>,
}

pub async fn schedule_version(
    State(engine): State<Arc<Engine>>,
    Path((id, vid)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    Json(body): Json<ScheduleBody>,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let (template, _) = version_of_template(&engine, id, vid).await?;
    require_editor(&engine, &identity, template.workspace_id).await?;
    Ok(Json(
        engine.lifecycle().schedule(vid, body.scheduled_at).await?,
    ))
}

pub async fn cancel_schedule(
    State(engine): State<Arc<Engine>>,
    Path((id, vid)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let (template, _) = version_of_template(&engine, id, vid).await?;
    require_editor(&engine, &identity, template.workspace_id).await?;
    Ok(Json(engine.lifecycle().cancel_schedule(vid).await?))
}

#[derive(Debug, Deserialize, Default)]
pub struct ArchiveQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn archive_version(
    State(engine): State<Arc<Engine>>,
    Path((id, vid)): Path<(Uuid, Uuid)>,
    Query(query): Query<ArchiveQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let (template, _) = version_of_template(&engine, id, vid).await?;
    require_editor(&engine, &identity, template.workspace_id).await?;
    Ok(Json(engine.lifecycle().archive(vid, query.force).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceInjectable {
    pub key: String,
    #[serde(default)]
    pub label: LocaleMap,
    #[serde(default)]
    pub description: LocaleMap,
    #[serde(default)]
    pub default_value: String,
}

pub async fn create_workspace_injectable(
    State(engine): State<Arc<Engine>>,
    Path(workspace_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<CreateWorkspaceInjectable>,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let workspace = load_workspace(&engine, workspace_id).await?;
    require_editor(&engine, &identity, workspace.id).await?;
    validate_workspace_key(&body.key)?;
    if engine.registry().contains(&body.key) {
        return Err(EngineError::CodeCollision(body.key));
    }
    if engine
        .stores()
        .workspace_injectables
        .by_key(workspace.id, &body.key)
        .await?
        .is_some()
    {
        return Err(EngineError::Validation(format!(
            "injectable key `{}` already exists in workspace",
            body.key
        )));
    }
    let now = Utc::now();
    let injectable = WorkspaceInjectable {
        id: Uuid::new_v4(),
        workspace_id: workspace.id,
        key: body.key,
        label: body.label,
        description: body.description,
        default_value: body.default_value,
        created_at: now,
        updated_at: now,
    };
    engine
        .stores()
        .workspace_injectables
        .insert(&injectable)
        .await?;
    Ok((StatusCode::CREATED, Json(injectable)))
}

pub async fn delete_workspace_injectable(
    State(engine): State<Arc<Engine>>,
    Path((workspace_id, injectable_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let identity = authenticate(&engine, RouteClass::Panel, &headers).await?;
    let workspace = load_workspace(&engine, workspace_id).await?;
    require_editor(&engine, &identity, workspace.id).await?;
    engine.delete_workspace_injectable(injectable_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
