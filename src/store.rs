pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::Result;
use crate::injectable::{SystemAssignment, WorkspaceInjectable};
use crate::template::{DocumentClassification, Template, TemplateVersion};
use crate::tenancy::{
    AccessEntityType, AccessRecord, Tenant, TenantMember, User, Workspace, WorkspaceMember,
};

/// The atomic product of a publish: the newly published version and the
/// sibling that was archived with it, if any. Both rows change in one
/// transaction.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub published: TemplateVersion,
    pub archived: Option<TemplateVersion>,
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn insert(&self, tenant: &Tenant) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Tenant>>;
    async fn by_code(&self, code: &str) -> Result<Option<Tenant>>;
    async fn list(&self) -> Result<Vec<Tenant>>;
    async fn update(&self, tenant: &Tenant) -> Result<()>;
    /// The seeded system tenant, if bootstrap has run.
    async fn system_tenant(&self) -> Result<Option<Tenant>>;
}

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn insert(&self, workspace: &Workspace) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Workspace>>;
    async fn by_code(&self, tenant_id: Option<Uuid>, code: &str) -> Result<Option<Workspace>>;
    async fn list_for_tenant(&self, tenant_id: Option<Uuid>) -> Result<Vec<Workspace>>;
    /// Optimistic update keyed on the `updated_at` the caller read.
    async fn update(&self, workspace: &Workspace, expected_updated_at: DateTime<Utc>)
        -> Result<()>;
}

#[async_trait]
pub trait ClassificationStore: Send + Sync {
    async fn insert(&self, classification: &DocumentClassification) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<DocumentClassification>>;
    async fn by_code(&self, tenant_id: Uuid, code: &str)
        -> Result<Option<DocumentClassification>>;
    async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<DocumentClassification>>;
    async fn update(&self, classification: &DocumentClassification) -> Result<()>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn insert(&self, template: &Template) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Template>>;
    async fn list_for_workspace(&self, workspace_id: Uuid) -> Result<Vec<Template>>;
    async fn update(&self, template: &Template) -> Result<()>;
    /// The template in `workspace_id` carrying `classification_id` that
    /// currently has a PUBLISHED version, excluding `exclude`.
    async fn published_for_classification(
        &self,
        workspace_id: Uuid,
        classification_id: Uuid,
        exclude: Uuid,
    ) -> Result<Option<Uuid>>;
}

#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn insert(&self, version: &TemplateVersion) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<TemplateVersion>>;
    async fn list_for_template(&self, template_id: Uuid) -> Result<Vec<TemplateVersion>>;
    async fn next_version_number(&self, template_id: Uuid) -> Result<i32>;
    /// Optimistic update; fails with `OptimisticLock` when the stored
    /// `updated_at` no longer matches.
    async fn update(
        &self,
        version: &TemplateVersion,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn published_for_template(&self, template_id: Uuid)
        -> Result<Option<TemplateVersion>>;
    async fn scheduled_for_template(&self, template_id: Uuid) -> Result<Vec<TemplateVersion>>;
    /// Scheduled versions whose fire time has passed.
    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<TemplateVersion>>;
    /// Atomically publishes `version_id` and archives the previously
    /// published sibling of the same template. Optimistically locked on
    /// the version's `updated_at`.
    async fn publish_swap(
        &self,
        version_id: Uuid,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome>;
}

#[async_trait]
pub trait WorkspaceInjectableStore: Send + Sync {
    async fn insert(&self, injectable: &WorkspaceInjectable) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<WorkspaceInjectable>>;
    async fn by_key(&self, workspace_id: Uuid, key: &str) -> Result<Option<WorkspaceInjectable>>;
    async fn list_for_workspace(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceInjectable>>;
    async fn update(&self, injectable: &WorkspaceInjectable) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn insert(&self, assignment: &SystemAssignment) -> Result<()>;
    async fn update(&self, assignment: &SystemAssignment) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    /// Every assignment relevant to one workspace: PUBLIC rows, rows of
    /// its tenant, and rows of the workspace itself.
    async fn relevant_to(&self, workspace: &Workspace) -> Result<Vec<SystemAssignment>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert(&self, user: &User) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<User>>;
    async fn by_subject(&self, subject: &str) -> Result<Option<User>>;
    async fn count(&self) -> Result<u64>;
    async fn update(&self, user: &User) -> Result<()>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn add_workspace_member(&self, member: &WorkspaceMember) -> Result<()>;
    async fn workspace_members(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceMember>>;
    /// Refuses with `CannotRemoveOwner` when the member is the
    /// workspace's last OWNER.
    async fn remove_workspace_member(&self, member_id: Uuid) -> Result<()>;
    async fn add_tenant_member(&self, member: &TenantMember) -> Result<()>;
    async fn tenant_members(&self, tenant_id: Uuid) -> Result<Vec<TenantMember>>;
    async fn memberships_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<(Vec<WorkspaceMember>, Vec<TenantMember>)>;
}

#[async_trait]
pub trait AccessHistoryStore: Send + Sync {
    async fn record(&self, record: &AccessRecord) -> Result<()>;
    async fn recent(
        &self,
        user_id: Uuid,
        entity_type: AccessEntityType,
        limit: usize,
    ) -> Result<Vec<AccessRecord>>;
}

/// The full set of persistence ports the engine runs against.
#[derive(Clone)]
pub struct Stores {
    pub tenants: Arc<dyn TenantStore>,
    pub workspaces: Arc<dyn WorkspaceStore>,
    pub classifications: Arc<dyn ClassificationStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub versions: Arc<dyn VersionStore>,
    pub workspace_injectables: Arc<dyn WorkspaceInjectableStore>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub users: Arc<dyn UserStore>,
    pub memberships: Arc<dyn MembershipStore>,
    pub access_history: Arc<dyn AccessHistoryStore>,
}
