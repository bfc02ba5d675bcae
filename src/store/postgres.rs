use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DatabaseSettings;
use crate::injectable::{AssignmentScope, LocaleMap, SystemAssignment, WorkspaceInjectable};
use crate::store::{
    AccessHistoryStore, AssignmentStore, ClassificationStore, MembershipStore, PublishOutcome,
    Stores, TemplateStore, TenantStore, UserStore, VersionStore, WorkspaceInjectableStore,
    WorkspaceStore,
};
use crate::template::{DocumentClassification, Template, TemplateVersion, VersionState};
use crate::tenancy::{
    AccessEntityType, AccessRecord, SystemRole, Tenant, TenantMember, TenantRole, TenantStatus,
    User, Workspace, WorkspaceMember, WorkspaceRole, WorkspaceStatus, WorkspaceType,
};
use crate::{EngineError, Result};

/// PostgreSQL-backed persistence. Statuses are integer-serialized,
/// content trees and locale maps live in JSONB columns, and the two-row
/// publish swap runs in one transaction. Schema migration is handled by
/// the external migration tool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .connect(&settings.url())
            .await?;
        Ok(Self { pool })
    }

    pub fn stores(&self) -> Stores {
        Stores {
            tenants: Arc::new(self.clone()),
            workspaces: Arc::new(self.clone()),
            classifications: Arc::new(self.clone()),
            templates: Arc::new(self.clone()),
            versions: Arc::new(self.clone()),
            workspace_injectables: Arc::new(self.clone()),
            assignments: Arc::new(self.clone()),
            users: Arc::new(self.clone()),
            memberships: Arc::new(self.clone()),
            access_history: Arc::new(self.clone()),
        }
    }

    /// Readiness probe.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn tenant_status_to_i32(status: TenantStatus) -> i32 {
    match status {
        TenantStatus::Active => 0,
        TenantStatus::Suspended => 1,
        TenantStatus::Archived => 2,
    }
}

fn tenant_status_from_i32(raw: i32) -> Result<TenantStatus> {
    match raw {
        0 => Ok(TenantStatus::Active),
        1 => Ok(TenantStatus::Suspended),
        2 => Ok(TenantStatus::Archived),
        other => Err(EngineError::Internal(format!("bad tenant status {other}"))),
    }
}

fn workspace_status_to_i32(status: WorkspaceStatus) -> i32 {
    match status {
        WorkspaceStatus::Active => 0,
        WorkspaceStatus::Suspended => 1,
        WorkspaceStatus::Archived => 2,
    }
}

fn workspace_status_from_i32(raw: i32) -> Result<WorkspaceStatus> {
    match raw {
        0 => Ok(WorkspaceStatus::Active),
        1 => Ok(WorkspaceStatus::Suspended),
        2 => Ok(WorkspaceStatus::Archived),
        other => Err(EngineError::Internal(format!("bad workspace status {other}"))),
    }
}

fn workspace_type_to_i32(t: WorkspaceType) -> i32 {
    match t {
        WorkspaceType::System => 0,
        WorkspaceType::Client => 1,
    }
}

fn workspace_type_from_i32(raw: i32) -> Result<WorkspaceType> {
    match raw {
        0 => Ok(WorkspaceType::System),
        1 => Ok(WorkspaceType::Client),
        other => Err(EngineError::Internal(format!("bad workspace type {other}"))),
    }
}

fn version_state_to_i32(state: VersionState) -> i32 {
    match state {
        VersionState::Draft => 0,
        VersionState::Scheduled => 1,
        VersionState::Published => 2,
        VersionState::Archived => 3,
    }
}

fn version_state_from_i32(raw: i32) -> Result<VersionState> {
    match raw {
        0 => Ok(VersionState::Draft),
        1 => Ok(VersionState::Scheduled),
        2 => Ok(VersionState::Published),
        3 => Ok(VersionState::Archived),
        other => Err(EngineError::Internal(format!("bad version state {other}"))),
    }
}

fn workspace_role_to_i32(role: WorkspaceRole) -> i32 {
    match role {
        WorkspaceRole::Viewer => 0,
        WorkspaceRole::Operator => 1,
        WorkspaceRole::Editor => 2,
        WorkspaceRole::Admin => 3,
        WorkspaceRole::Owner => 4,
    }
}

fn workspace_role_from_i32(raw: i32) -> Result<WorkspaceRole> {
    match raw {
        0 => Ok(WorkspaceRole::Viewer),
        1 => Ok(WorkspaceRole::Operator),
        2 => Ok(WorkspaceRole::Editor),
        3 => Ok(WorkspaceRole::Admin),
        4 => Ok(WorkspaceRole::Owner),
        other => Err(EngineError::Internal(format!("bad workspace role {other}"))),
    }
}

fn tenant_role_to_i32(role: TenantRole) -> i32 {
    match role {
        TenantRole::TenantAdmin => 0,
        TenantRole::TenantOwner => 1,
    }
}

fn tenant_role_from_i32(raw: i32) -> Result<TenantRole> {
    match raw {
        0 => Ok(TenantRole::TenantAdmin),
        1 => Ok(TenantRole::TenantOwner),
        other => Err(EngineError::Internal(format!("bad tenant role {other}"))),
    }
}

fn system_role_to_i32(role: SystemRole) -> i32 {
    match role {
        SystemRole::PlatformAdmin => 0,
        SystemRole::Superadmin => 1,
    }
}

fn system_role_from_i32(raw: i32) -> Result<SystemRole> {
    match raw {
        0 => Ok(SystemRole::PlatformAdmin),
        1 => Ok(SystemRole::Superadmin),
        other => Err(EngineError::Internal(format!("bad system role {other}"))),
    }
}

fn scope_to_i32(scope: AssignmentScope) -> i32 {
    match scope {
        AssignmentScope::Public => 0,
        AssignmentScope::Tenant => 1,
        AssignmentScope::Workspace => 2,
    }
}

fn scope_from_i32(raw: i32) -> Result<AssignmentScope> {
    match raw {
        0 => Ok(AssignmentScope::Public),
        1 => Ok(AssignmentScope::Tenant),
        2 => Ok(AssignmentScope::Workspace),
        other => Err(EngineError::Internal(format!("bad assignment scope {other}"))),
    }
}

fn entity_type_to_i32(t: AccessEntityType) -> i32 {
    match t {
        AccessEntityType::Tenant => 0,
        AccessEntityType::Workspace => 1,
    }
}

fn entity_type_from_i32(raw: i32) -> Result<AccessEntityType> {
    match raw {
        0 => Ok(AccessEntityType::Tenant),
        1 => Ok(AccessEntityType::Workspace),
        other => Err(EngineError::Internal(format!("bad entity type {other}"))),
    }
}

fn locale_map_to_json(map: &LocaleMap) -> serde_json::Value {
    serde_json::to_value(map).unwrap_or(serde_json::Value::Null)
}

fn locale_map_from_json(value: serde_json::Value) -> LocaleMap {
    serde_json::from_value(value).unwrap_or_default()
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant> {
    Ok(Tenant {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        status: tenant_status_from_i32(row.try_get("status")?)?,
        is_system: row.try_get("is_system")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn workspace_from_row(row: &PgRow) -> Result<Workspace> {
    Ok(Workspace {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        workspace_type: workspace_type_from_i32(row.try_get("workspace_type")?)?,
        status: workspace_status_from_i32(row.try_get("status")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn classification_from_row(row: &PgRow) -> Result<DocumentClassification> {
    Ok(DocumentClassification {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        code: row.try_get("code")?,
        name: locale_map_from_json(row.try_get("name")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn template_from_row(row: &PgRow) -> Result<Template> {
    Ok(Template {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        folder_id: row.try_get("folder_id")?,
        classification_id: row.try_get("classification_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn version_from_row(row: &PgRow) -> Result<TemplateVersion> {
    let content: Option<serde_json::Value> = row.try_get("content")?;
    let content = match content {
        Some(value) => Some(
            serde_json::from_value(value)
                .map_err(|e| EngineError::Internal(format!("corrupt content column: {e}")))?,
        ),
        None => None,
    };
    Ok(TemplateVersion {
        id: row.try_get("id")?,
        template_id: row.try_get("template_id")?,
        version_number: row.try_get("version_number")?,
        name: row.try_get("name")?,
        state: version_state_from_i32(row.try_get("state")?)?,
        content,
        scheduled_at: row.try_get("scheduled_at")?,
        published_at: row.try_get("published_at")?,
        archived_at: row.try_get("archived_at")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn injectable_from_row(row: &PgRow) -> Result<WorkspaceInjectable> {
    Ok(WorkspaceInjectable {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        key: row.try_get("key")?,
        label: locale_map_from_json(row.try_get("label")?),
        description: locale_map_from_json(row.try_get("description")?),
        default_value: row.try_get("default_value")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn assignment_from_row(row: &PgRow) -> Result<SystemAssignment> {
    Ok(SystemAssignment {
        id: row.try_get("id")?,
        injector_code: row.try_get("injector_code")?,
        scope: scope_from_i32(row.try_get("scope")?)?,
        tenant_id: row.try_get("tenant_id")?,
        workspace_id: row.try_get("workspace_id")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User> {
    let system_role: Option<i32> = row.try_get("system_role")?;
    Ok(User {
        id: row.try_get("id")?,
        subject: row.try_get("subject")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        system_role: system_role.map(system_role_from_i32).transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

fn workspace_member_from_row(row: &PgRow) -> Result<WorkspaceMember> {
    Ok(WorkspaceMember {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        user_id: row.try_get("user_id")?,
        role: workspace_role_from_i32(row.try_get("role")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn tenant_member_from_row(row: &PgRow) -> Result<TenantMember> {
    Ok(TenantMember {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        role: tenant_role_from_i32(row.try_get("role")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn access_from_row(row: &PgRow) -> Result<AccessRecord> {
    Ok(AccessRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        entity_type: entity_type_from_i32(row.try_get("entity_type")?)?,
        entity_id: row.try_get("entity_id")?,
        accessed_at: row.try_get("accessed_at")?,
    })
}

#[async_trait]
impl TenantStore for PostgresStore {
    async fn insert(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenancy.tenants (id, code, name, status, is_system, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(tenant.id)
        .bind(&tenant.code)
        .bind(&tenant.name)
        .bind(tenant_status_to_i32(tenant.status))
        .bind(tenant.is_system)
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Tenant>> {
        sqlx::query("SELECT * FROM tenancy.tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| tenant_from_row(&row))
            .transpose()
    }

    async fn by_code(&self, code: &str) -> Result<Option<Tenant>> {
        sqlx::query("SELECT * FROM tenancy.tenants WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| tenant_from_row(&row))
            .transpose()
    }

    async fn list(&self) -> Result<Vec<Tenant>> {
        sqlx::query("SELECT * FROM tenancy.tenants ORDER BY code")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(tenant_from_row)
            .collect()
    }

    async fn update(&self, tenant: &Tenant) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tenancy.tenants SET name = $2, status = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(tenant_status_to_i32(tenant.status))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::TenantNotFound(tenant.id.to_string()));
        }
        Ok(())
    }

    async fn system_tenant(&self) -> Result<Option<Tenant>> {
        sqlx::query("SELECT * FROM tenancy.tenants WHERE is_system LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .map(|row| tenant_from_row(&row))
            .transpose()
    }
}

#[async_trait]
impl WorkspaceStore for PostgresStore {
    async fn insert(&self, workspace: &Workspace) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenancy.workspaces \
             (id, tenant_id, code, name, workspace_type, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(workspace.id)
        .bind(workspace.tenant_id)
        .bind(&workspace.code)
        .bind(&workspace.name)
        .bind(workspace_type_to_i32(workspace.workspace_type))
        .bind(workspace_status_to_i32(workspace.status))
        .bind(workspace.created_at)
        .bind(workspace.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Workspace>> {
        sqlx::query("SELECT * FROM tenancy.workspaces WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| workspace_from_row(&row))
            .transpose()
    }

    async fn by_code(&self, tenant_id: Option<Uuid>, code: &str) -> Result<Option<Workspace>> {
        sqlx::query(
            "SELECT * FROM tenancy.workspaces \
             WHERE tenant_id IS NOT DISTINCT FROM $1 AND code = $2",
        )
        .bind(tenant_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| workspace_from_row(&row))
        .transpose()
    }

    async fn list_for_tenant(&self, tenant_id: Option<Uuid>) -> Result<Vec<Workspace>> {
        sqlx::query(
            "SELECT * FROM tenancy.workspaces \
             WHERE tenant_id IS NOT DISTINCT FROM $1 ORDER BY code",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(workspace_from_row)
        .collect()
    }

    async fn update(
        &self,
        workspace: &Workspace,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tenancy.workspaces SET name = $2, status = $3, updated_at = $4 \
             WHERE id = $1 AND updated_at = $5",
        )
        .bind(workspace.id)
        .bind(&workspace.name)
        .bind(workspace_status_to_i32(workspace.status))
        .bind(Utc::now())
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return match WorkspaceStore::get(self, workspace.id).await? {
                Some(_) => Err(EngineError::OptimisticLock),
                None => Err(EngineError::WorkspaceNotFound(workspace.id.to_string())),
            };
        }
        Ok(())
    }
}

#[async_trait]
impl ClassificationStore for PostgresStore {
    async fn insert(&self, classification: &DocumentClassification) -> Result<()> {
        sqlx::query(
            "INSERT INTO content.document_classifications \
             (id, tenant_id, code, name, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(classification.id)
        .bind(classification.tenant_id)
        .bind(&classification.code)
        .bind(locale_map_to_json(&classification.name))
        .bind(classification.created_at)
        .bind(classification.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DocumentClassification>> {
        sqlx::query("SELECT * FROM content.document_classifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| classification_from_row(&row))
            .transpose()
    }

    async fn by_code(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<Option<DocumentClassification>> {
        sqlx::query(
            "SELECT * FROM content.document_classifications WHERE tenant_id = $1 AND code = $2",
        )
        .bind(tenant_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| classification_from_row(&row))
        .transpose()
    }

    async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<DocumentClassification>> {
        sqlx::query(
            "SELECT * FROM content.document_classifications WHERE tenant_id = $1 ORDER BY code",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(classification_from_row)
        .collect()
    }

    async fn update(&self, classification: &DocumentClassification) -> Result<()> {
        // The code is immutable after creation; only the display name moves.
        let result = sqlx::query(
            "UPDATE content.document_classifications SET name = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(classification.id)
        .bind(locale_map_to_json(&classification.name))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::ClassificationNotFound(
                classification.code.clone(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TemplateStore for PostgresStore {
    async fn insert(&self, template: &Template) -> Result<()> {
        sqlx::query(
            "INSERT INTO content.templates \
             (id, workspace_id, folder_id, classification_id, name, description, deleted_at, \
              created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(template.id)
        .bind(template.workspace_id)
        .bind(template.folder_id)
        .bind(template.classification_id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(template.deleted_at)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Template>> {
        sqlx::query("SELECT * FROM content.templates WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| template_from_row(&row))
            .transpose()
    }

    async fn list_for_workspace(&self, workspace_id: Uuid) -> Result<Vec<Template>> {
        sqlx::query(
            "SELECT * FROM content.templates \
             WHERE workspace_id = $1 AND deleted_at IS NULL ORDER BY name",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(template_from_row)
        .collect()
    }

    async fn update(&self, template: &Template) -> Result<()> {
        let result = sqlx::query(
            "UPDATE content.templates SET folder_id = $2, classification_id = $3, name = $4, \
             description = $5, deleted_at = $6, updated_at = $7 WHERE id = $1",
        )
        .bind(template.id)
        .bind(template.folder_id)
        .bind(template.classification_id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(template.deleted_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::TemplateNotFound(template.id.to_string()));
        }
        Ok(())
    }

    async fn published_for_classification(
        &self,
        workspace_id: Uuid,
        classification_id: Uuid,
        exclude: Uuid,
    ) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT t.id FROM content.templates t \
             JOIN content.template_versions v ON v.template_id = t.id \
             WHERE t.workspace_id = $1 AND t.classification_id = $2 \
               AND t.id <> $3 AND v.state = $4 \
             LIMIT 1",
        )
        .bind(workspace_id)
        .bind(classification_id)
        .bind(exclude)
        .bind(version_state_to_i32(VersionState::Published))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get("id")).transpose()?)
    }
}

#[async_trait]
impl VersionStore for PostgresStore {
    async fn insert(&self, version: &TemplateVersion) -> Result<()> {
        let content = version
            .content
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| EngineError::Internal(format!("content serialization: {e}")))?;
        sqlx::query(
            "INSERT INTO content.template_versions \
             (id, template_id, version_number, name, state, content, scheduled_at, published_at, \
              archived_at, created_by, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(version.id)
        .bind(version.template_id)
        .bind(version.version_number)
        .bind(&version.name)
        .bind(version_state_to_i32(version.state))
        .bind(content)
        .bind(version.scheduled_at)
        .bind(version.published_at)
        .bind(version.archived_at)
        .bind(version.created_by)
        .bind(version.created_at)
        .bind(version.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<TemplateVersion>> {
        sqlx::query("SELECT * FROM content.template_versions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| version_from_row(&row))
            .transpose()
    }

    async fn list_for_template(&self, template_id: Uuid) -> Result<Vec<TemplateVersion>> {
        sqlx::query(
            "SELECT * FROM content.template_versions \
             WHERE template_id = $1 ORDER BY version_number",
        )
        .bind(template_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(version_from_row)
        .collect()
    }

    async fn next_version_number(&self, template_id: Uuid) -> Result<i32> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version_number), 0) AS current \
             FROM content.template_versions WHERE template_id = $1",
        )
        .bind(template_id)
        .fetch_one(&self.pool)
        .await?;
        let current: i32 = row.try_get("current")?;
        Ok(current + 1)
    }

    async fn update(
        &self,
        version: &TemplateVersion,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let content = version
            .content
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| EngineError::Internal(format!("content serialization: {e}")))?;
        let result = sqlx::query(
            "UPDATE content.template_versions SET name = $2, state = $3, content = $4, \
             scheduled_at = $5, published_at = $6, archived_at = $7, updated_at = $8 \
             WHERE id = $1 AND updated_at = $9",
        )
        .bind(version.id)
        .bind(&version.name)
        .bind(version_state_to_i32(version.state))
        .bind(content)
        .bind(version.scheduled_at)
        .bind(version.published_at)
        .bind(version.archived_at)
        .bind(Utc::now())
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return match VersionStore::get(self, version.id).await? {
                Some(_) => Err(EngineError::OptimisticLock),
                None => Err(EngineError::VersionNotFound(version.id.to_string())),
            };
        }
        Ok(())
    }

    async fn published_for_template(
        &self,
        template_id: Uuid,
    ) -> Result<Option<TemplateVersion>> {
        sqlx::query(
            "SELECT * FROM content.template_versions WHERE template_id = $1 AND state = $2",
        )
        .bind(template_id)
        .bind(version_state_to_i32(VersionState::Published))
        .fetch_optional(&self.pool)
        .await?
        .map(|row| version_from_row(&row))
        .transpose()
    }

    async fn scheduled_for_template(&self, template_id: Uuid) -> Result<Vec<TemplateVersion>> {
        sqlx::query(
            "SELECT * FROM content.template_versions WHERE template_id = $1 AND state = $2",
        )
        .bind(template_id)
        .bind(version_state_to_i32(VersionState::Scheduled))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(version_from_row)
        .collect()
    }

    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<TemplateVersion>> {
        sqlx::query(
            "SELECT * FROM content.template_versions \
             WHERE state = $1 AND scheduled_at <= $2 ORDER BY scheduled_at",
        )
        .bind(version_state_to_i32(VersionState::Scheduled))
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(version_from_row)
        .collect()
    }

    async fn publish_swap(
        &self,
        version_id: Uuid,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(
            "SELECT * FROM content.template_versions WHERE id = $1 FOR UPDATE",
        )
        .bind(version_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| version_from_row(&row))
        .transpose()?
        .ok_or_else(|| EngineError::VersionNotFound(version_id.to_string()))?;

        if current.updated_at != expected_updated_at {
            return Err(EngineError::OptimisticLock);
        }
        if current.state == VersionState::Published {
            return Err(EngineError::VersionAlreadyPublished);
        }

        let archived = sqlx::query(
            "UPDATE content.template_versions \
             SET state = $3, archived_at = $4, updated_at = $4 \
             WHERE template_id = $1 AND state = $2 AND id <> $5 \
             RETURNING *",
        )
        .bind(current.template_id)
        .bind(version_state_to_i32(VersionState::Published))
        .bind(version_state_to_i32(VersionState::Archived))
        .bind(now)
        .bind(version_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| version_from_row(&row))
        .transpose()?;

        let published = sqlx::query(
            "UPDATE content.template_versions \
             SET state = $2, published_at = $3, scheduled_at = NULL, updated_at = $3 \
             WHERE id = $1 \
             RETURNING *",
        )
        .bind(version_id)
        .bind(version_state_to_i32(VersionState::Published))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(EngineError::Database)
        .and_then(|row| version_from_row(&row))?;

        tx.commit().await?;
        Ok(PublishOutcome {
            published,
            archived,
        })
    }
}

#[async_trait]
impl WorkspaceInjectableStore for PostgresStore {
    async fn insert(&self, injectable: &WorkspaceInjectable) -> Result<()> {
        sqlx::query(
            "INSERT INTO content.workspace_injectables \
             (id, workspace_id, key, label, description, default_value, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(injectable.id)
        .bind(injectable.workspace_id)
        .bind(&injectable.key)
        .bind(locale_map_to_json(&injectable.label))
        .bind(locale_map_to_json(&injectable.description))
        .bind(&injectable.default_value)
        .bind(injectable.created_at)
        .bind(injectable.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkspaceInjectable>> {
        sqlx::query("SELECT * FROM content.workspace_injectables WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| injectable_from_row(&row))
            .transpose()
    }

    async fn by_key(
        &self,
        workspace_id: Uuid,
        key: &str,
    ) -> Result<Option<WorkspaceInjectable>> {
        sqlx::query(
            "SELECT * FROM content.workspace_injectables WHERE workspace_id = $1 AND key = $2",
        )
        .bind(workspace_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| injectable_from_row(&row))
        .transpose()
    }

    async fn list_for_workspace(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceInjectable>> {
        sqlx::query(
            "SELECT * FROM content.workspace_injectables WHERE workspace_id = $1 ORDER BY key",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(injectable_from_row)
        .collect()
    }

    async fn update(&self, injectable: &WorkspaceInjectable) -> Result<()> {
        let result = sqlx::query(
            "UPDATE content.workspace_injectables SET label = $2, description = $3, \
             default_value = $4, updated_at = $5 WHERE id = $1",
        )
        .bind(injectable.id)
        .bind(locale_map_to_json(&injectable.label))
        .bind(locale_map_to_json(&injectable.description))
        .bind(&injectable.default_value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::InjectableNotFound(injectable.key.clone()));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM content.workspace_injectables WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for PostgresStore {
    async fn insert(&self, assignment: &SystemAssignment) -> Result<()> {
        sqlx::query(
            "INSERT INTO content.system_assignments \
             (id, injector_code, scope, tenant_id, workspace_id, is_active, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(assignment.id)
        .bind(&assignment.injector_code)
        .bind(scope_to_i32(assignment.scope))
        .bind(assignment.tenant_id)
        .bind(assignment.workspace_id)
        .bind(assignment.is_active)
        .bind(assignment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, assignment: &SystemAssignment) -> Result<()> {
        let result = sqlx::query(
            "UPDATE content.system_assignments SET is_active = $2 WHERE id = $1",
        )
        .bind(assignment.id)
        .bind(assignment.is_active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::InjectableNotFound(
                assignment.injector_code.clone(),
            ));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM content.system_assignments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn relevant_to(&self, workspace: &Workspace) -> Result<Vec<SystemAssignment>> {
        sqlx::query(
            "SELECT * FROM content.system_assignments \
             WHERE scope = 0 \
                OR (scope = 1 AND tenant_id IS NOT DISTINCT FROM $1 AND tenant_id IS NOT NULL) \
                OR (scope = 2 AND workspace_id = $2)",
        )
        .bind(workspace.tenant_id)
        .bind(workspace.id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(assignment_from_row)
        .collect()
    }
}

#[async_trait]
impl UserStore for PostgresStore {
    async fn insert(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenancy.users \
             (id, subject, email, display_name, system_role, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(user.id)
        .bind(&user.subject)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.system_role.map(system_role_to_i32))
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<User>> {
        sqlx::query("SELECT * FROM tenancy.users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| user_from_row(&row))
            .transpose()
    }

    async fn by_subject(&self, subject: &str) -> Result<Option<User>> {
        sqlx::query("SELECT * FROM tenancy.users WHERE subject = $1")
            .bind(subject)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| user_from_row(&row))
            .transpose()
    }

    async fn count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tenancy.users")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn update(&self, user: &User) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tenancy.users SET email = $2, display_name = $3, system_role = $4 \
             WHERE id = $1",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.system_role.map(system_role_to_i32))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::UserNotFound(user.id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for PostgresStore {
    async fn add_workspace_member(&self, member: &WorkspaceMember) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenancy.workspace_members (id, workspace_id, user_id, role, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(member.id)
        .bind(member.workspace_id)
        .bind(member.user_id)
        .bind(workspace_role_to_i32(member.role))
        .bind(member.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn workspace_members(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceMember>> {
        sqlx::query("SELECT * FROM tenancy.workspace_members WHERE workspace_id = $1")
            .bind(workspace_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(workspace_member_from_row)
            .collect()
    }

    async fn remove_workspace_member(&self, member_id: Uuid) -> Result<()> {
        // The last-owner guard and the delete run in one transaction so
        // two concurrent removals cannot both pass the count.
        let mut tx = self.pool.begin().await?;
        let member = sqlx::query(
            "SELECT * FROM tenancy.workspace_members WHERE id = $1 FOR UPDATE",
        )
        .bind(member_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| workspace_member_from_row(&row))
        .transpose()?
        .ok_or_else(|| EngineError::UserNotFound(member_id.to_string()))?;

        if member.role == WorkspaceRole::Owner {
            let row = sqlx::query(
                "SELECT COUNT(*) AS owners FROM tenancy.workspace_members \
                 WHERE workspace_id = $1 AND role = $2",
            )
            .bind(member.workspace_id)
            .bind(workspace_role_to_i32(WorkspaceRole::Owner))
            .fetch_one(&mut *tx)
            .await?;
            let owners: i64 = row.try_get("owners")?;
            if owners <= 1 {
                return Err(EngineError::CannotRemoveOwner);
            }
        }
        sqlx::query("DELETE FROM tenancy.workspace_members WHERE id = $1")
            .bind(member_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn add_tenant_member(&self, member: &TenantMember) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenancy.tenant_members (id, tenant_id, user_id, role, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(member.id)
        .bind(member.tenant_id)
        .bind(member.user_id)
        .bind(tenant_role_to_i32(member.role))
        .bind(member.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn tenant_members(&self, tenant_id: Uuid) -> Result<Vec<TenantMember>> {
        sqlx::query("SELECT * FROM tenancy.tenant_members WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(tenant_member_from_row)
            .collect()
    }

    async fn memberships_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<(Vec<WorkspaceMember>, Vec<TenantMember>)> {
        let workspace = sqlx::query("SELECT * FROM tenancy.workspace_members WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(workspace_member_from_row)
            .collect::<Result<Vec<_>>>()?;
        let tenant = sqlx::query("SELECT * FROM tenancy.tenant_members WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(tenant_member_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((workspace, tenant))
    }
}

#[async_trait]
impl AccessHistoryStore for PostgresStore {
    async fn record(&self, record: &AccessRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO content.access_history \
             (id, user_id, entity_type, entity_id, accessed_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(entity_type_to_i32(record.entity_type))
        .bind(record.entity_id)
        .bind(record.accessed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(
        &self,
        user_id: Uuid,
        entity_type: AccessEntityType,
        limit: usize,
    ) -> Result<Vec<AccessRecord>> {
        sqlx::query(
            "SELECT * FROM ( \
                 SELECT DISTINCT ON (entity_id) * FROM content.access_history \
                 WHERE user_id = $1 AND entity_type = $2 \
                 ORDER BY entity_id, accessed_at DESC \
             ) latest ORDER BY accessed_at DESC LIMIT $3",
        )
        .bind(user_id)
        .bind(entity_type_to_i32(entity_type))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(access_from_row)
        .collect()
    }
}
