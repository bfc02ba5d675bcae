use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::injectable::{AssignmentScope, SystemAssignment, WorkspaceInjectable};
use crate::store::{
    AccessHistoryStore, AssignmentStore, ClassificationStore, MembershipStore, PublishOutcome,
    Stores, TemplateStore, TenantStore, UserStore, VersionStore, WorkspaceInjectableStore,
    WorkspaceStore,
};
use crate::template::{DocumentClassification, Template, TemplateVersion, VersionState};
use crate::tenancy::{
    AccessEntityType, AccessRecord, Tenant, TenantMember, User, Workspace, WorkspaceMember,
    WorkspaceRole,
};
use crate::{EngineError, Result};

#[derive(Default)]
struct State {
    tenants: HashMap<Uuid, Tenant>,
    workspaces: HashMap<Uuid, Workspace>,
    classifications: HashMap<Uuid, DocumentClassification>,
    templates: HashMap<Uuid, Template>,
    versions: HashMap<Uuid, TemplateVersion>,
    workspace_injectables: HashMap<Uuid, WorkspaceInjectable>,
    assignments: HashMap<Uuid, SystemAssignment>,
    users: HashMap<Uuid, User>,
    workspace_members: HashMap<Uuid, WorkspaceMember>,
    tenant_members: HashMap<Uuid, TenantMember>,
    access: Vec<AccessRecord>,
}

/// In-process store backing tests and `serve --ephemeral`. All traits
/// share one mutex; every guarded section is lock-then-mutate with no
/// awaits, which is what makes `publish_swap` atomic here.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
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
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn insert(&self, tenant: &Tenant) -> Result<()> {
        self.state.lock().tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Tenant>> {
        Ok(self.state.lock().tenants.get(&id).cloned())
    }

    async fn by_code(&self, code: &str) -> Result<Option<Tenant>> {
        Ok(self
            .state
            .lock()
            .tenants
            .values()
            .find(|t| t.code == code)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self.state.lock().tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(tenants)
    }

    async fn update(&self, tenant: &Tenant) -> Result<()> {
        let mut state = self.state.lock();
        if !state.tenants.contains_key(&tenant.id) {
            return Err(EngineError::TenantNotFound(tenant.id.to_string()));
        }
        state.tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn system_tenant(&self) -> Result<Option<Tenant>> {
        Ok(self
            .state
            .lock()
            .tenants
            .values()
            .find(|t| t.is_system)
            .cloned())
    }
}

#[async_trait]
impl WorkspaceStore for MemoryStore {
    async fn insert(&self, workspace: &Workspace) -> Result<()> {
        self.state
            .lock()
            .workspaces
            .insert(workspace.id, workspace.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Workspace>> {
        Ok(self.state.lock().workspaces.get(&id).cloned())
    }

    async fn by_code(&self, tenant_id: Option<Uuid>, code: &str) -> Result<Option<Workspace>> {
        Ok(self
            .state
            .lock()
            .workspaces
            .values()
            .find(|w| w.tenant_id == tenant_id && w.code == code)
            .cloned())
    }

    async fn list_for_tenant(&self, tenant_id: Option<Uuid>) -> Result<Vec<Workspace>> {
        let mut out: Vec<Workspace> = self
            .state
            .lock()
            .workspaces
            .values()
            .filter(|w| w.tenant_id == tenant_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(out)
    }

    async fn update(
        &self,
        workspace: &Workspace,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let stored = state
            .workspaces
            .get_mut(&workspace.id)
            .ok_or_else(|| EngineError::WorkspaceNotFound(workspace.id.to_string()))?;
        if stored.updated_at != expected_updated_at {
            return Err(EngineError::OptimisticLock);
        }
        let mut fresh = workspace.clone();
        fresh.updated_at = Utc::now();
        *stored = fresh;
        Ok(())
    }
}

#[async_trait]
impl ClassificationStore for MemoryStore {
    async fn insert(&self, classification: &DocumentClassification) -> Result<()> {
        self.state
            .lock()
            .classifications
            .insert(classification.id, classification.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DocumentClassification>> {
        Ok(self.state.lock().classifications.get(&id).cloned())
    }

    async fn by_code(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<Option<DocumentClassification>> {
        Ok(self
            .state
            .lock()
            .classifications
            .values()
            .find(|c| c.tenant_id == tenant_id && c.code == code)
            .cloned())
    }

    async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<DocumentClassification>> {
        let mut out: Vec<DocumentClassification> = self
            .state
            .lock()
            .classifications
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(out)
    }

    async fn update(&self, classification: &DocumentClassification) -> Result<()> {
        let mut state = self.state.lock();
        if !state.classifications.contains_key(&classification.id) {
            return Err(EngineError::ClassificationNotFound(
                classification.code.clone(),
            ));
        }
        state
            .classifications
            .insert(classification.id, classification.clone());
        Ok(())
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn insert(&self, template: &Template) -> Result<()> {
        self.state
            .lock()
            .templates
            .insert(template.id, template.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Template>> {
        Ok(self.state.lock().templates.get(&id).cloned())
    }

    async fn list_for_workspace(&self, workspace_id: Uuid) -> Result<Vec<Template>> {
        let mut out: Vec<Template> = self
            .state
            .lock()
            .templates
            .values()
            .filter(|t| t.workspace_id == workspace_id && t.deleted_at.is_none())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn update(&self, template: &Template) -> Result<()> {
        let mut state = self.state.lock();
        if !state.templates.contains_key(&template.id) {
            return Err(EngineError::TemplateNotFound(template.id.to_string()));
        }
        state.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn published_for_classification(
        &self,
        workspace_id: Uuid,
        classification_id: Uuid,
        exclude: Uuid,
    ) -> Result<Option<Uuid>> {
        let state = self.state.lock();
        for template in state.templates.values() {
            if template.workspace_id != workspace_id
                || template.classification_id != Some(classification_id)
                || template.id == exclude
            {
                continue;
            }
            let published = state
                .versions
                .values()
                .any(|v| v.template_id == template.id && v.state == VersionState::Published);
            if published {
                return Ok(Some(template.id));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl VersionStore for MemoryStore {
    async fn insert(&self, version: &TemplateVersion) -> Result<()> {
        self.state
            .lock()
            .versions
            .insert(version.id, version.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<TemplateVersion>> {
        Ok(self.state.lock().versions.get(&id).cloned())
    }

    async fn list_for_template(&self, template_id: Uuid) -> Result<Vec<TemplateVersion>> {
        let mut out: Vec<TemplateVersion> = self
            .state
            .lock()
            .versions
            .values()
            .filter(|v| v.template_id == template_id)
            .cloned()
            .collect();
        out.sort_by_key(|v| v.version_number);
        Ok(out)
    }

    async fn next_version_number(&self, template_id: Uuid) -> Result<i32> {
        Ok(self
            .state
            .lock()
            .versions
            .values()
            .filter(|v| v.template_id == template_id)
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
            + 1)
    }

    async fn update(
        &self,
        version: &TemplateVersion,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let stored = state
            .versions
            .get_mut(&version.id)
            .ok_or_else(|| EngineError::VersionNotFound(version.id.to_string()))?;
        if stored.updated_at != expected_updated_at {
            return Err(EngineError::OptimisticLock);
        }
        let mut fresh = version.clone();
        fresh.updated_at = Utc::now();
        *stored = fresh;
        Ok(())
    }

    async fn published_for_template(
        &self,
        template_id: Uuid,
    ) -> Result<Option<TemplateVersion>> {
        Ok(self
            .state
            .lock()
            .versions
            .values()
            .find(|v| v.template_id == template_id && v.state == VersionState::Published)
            .cloned())
    }

    async fn scheduled_for_template(&self, template_id: Uuid) -> Result<Vec<TemplateVersion>> {
        Ok(self
            .state
            .lock()
            .versions
            .values()
            .filter(|v| v.template_id == template_id && v.state == VersionState::Scheduled)
            .cloned()
            .collect())
    }

    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<TemplateVersion>> {
        Ok(self
            .state
            .lock()
            .versions
            .values()
            .filter(|v| {
                v.state == VersionState::Scheduled
                    && v.scheduled_at.is_some_and(|t| t <= now)
            })
            .cloned()
            .collect())
    }

    async fn publish_swap(
        &self,
        version_id: Uuid,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome> {
        let mut state = self.state.lock();
        let current = state
            .versions
            .get(&version_id)
            .cloned()
            .ok_or_else(|| EngineError::VersionNotFound(version_id.to_string()))?;
        if current.updated_at != expected_updated_at {
            return Err(EngineError::OptimisticLock);
        }
        if current.state == VersionState::Published {
            return Err(EngineError::VersionAlreadyPublished);
        }

        let prior = state
            .versions
            .values()
            .find(|v| {
                v.template_id == current.template_id
                    && v.state == VersionState::Published
                    && v.id != version_id
            })
            .cloned();
        let archived = prior.map(|mut p| {
            p.state = VersionState::Archived;
            p.archived_at = Some(now);
            p.updated_at = now;
            state.versions.insert(p.id, p.clone());
            p
        });

        let mut published = current;
        published.state = VersionState::Published;
        published.published_at = Some(now);
        published.scheduled_at = None;
        published.updated_at = now;
        state.versions.insert(published.id, published.clone());

        Ok(PublishOutcome {
            published,
            archived,
        })
    }
}

#[async_trait]
impl WorkspaceInjectableStore for MemoryStore {
    async fn insert(&self, injectable: &WorkspaceInjectable) -> Result<()> {
        self.state
            .lock()
            .workspace_injectables
            .insert(injectable.id, injectable.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkspaceInjectable>> {
        Ok(self.state.lock().workspace_injectables.get(&id).cloned())
    }

    async fn by_key(
        &self,
        workspace_id: Uuid,
        key: &str,
    ) -> Result<Option<WorkspaceInjectable>> {
        Ok(self
            .state
            .lock()
            .workspace_injectables
            .values()
            .find(|i| i.workspace_id == workspace_id && i.key == key)
            .cloned())
    }

    async fn list_for_workspace(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceInjectable>> {
        let mut out: Vec<WorkspaceInjectable> = self
            .state
            .lock()
            .workspace_injectables
            .values()
            .filter(|i| i.workspace_id == workspace_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn update(&self, injectable: &WorkspaceInjectable) -> Result<()> {
        let mut state = self.state.lock();
        if !state.workspace_injectables.contains_key(&injectable.id) {
            return Err(EngineError::InjectableNotFound(injectable.key.clone()));
        }
        state
            .workspace_injectables
            .insert(injectable.id, injectable.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.state.lock().workspace_injectables.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn insert(&self, assignment: &SystemAssignment) -> Result<()> {
        self.state
            .lock()
            .assignments
            .insert(assignment.id, assignment.clone());
        Ok(())
    }

    async fn update(&self, assignment: &SystemAssignment) -> Result<()> {
        let mut state = self.state.lock();
        if !state.assignments.contains_key(&assignment.id) {
            return Err(EngineError::InjectableNotFound(
                assignment.injector_code.clone(),
            ));
        }
        state.assignments.insert(assignment.id, assignment.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.state.lock().assignments.remove(&id);
        Ok(())
    }

    async fn relevant_to(&self, workspace: &Workspace) -> Result<Vec<SystemAssignment>> {
        Ok(self
            .state
            .lock()
            .assignments
            .values()
            .filter(|a| match a.scope {
                AssignmentScope::Public => true,
                AssignmentScope::Tenant => {
                    a.tenant_id.is_some() && a.tenant_id == workspace.tenant_id
                }
                AssignmentScope::Workspace => a.workspace_id == Some(workspace.id),
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert(&self, user: &User) -> Result<()> {
        self.state.lock().users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.state.lock().users.get(&id).cloned())
    }

    async fn by_subject(&self, subject: &str) -> Result<Option<User>> {
        Ok(self
            .state
            .lock()
            .users
            .values()
            .find(|u| u.subject == subject)
            .cloned())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.state.lock().users.len() as u64)
    }

    async fn update(&self, user: &User) -> Result<()> {
        let mut state = self.state.lock();
        if !state.users.contains_key(&user.id) {
            return Err(EngineError::UserNotFound(user.id.to_string()));
        }
        state.users.insert(user.id, user.clone());
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn add_workspace_member(&self, member: &WorkspaceMember) -> Result<()> {
        self.state
            .lock()
            .workspace_members
            .insert(member.id, member.clone());
        Ok(())
    }

    async fn workspace_members(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceMember>> {
        Ok(self
            .state
            .lock()
            .workspace_members
            .values()
            .filter(|m| m.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn remove_workspace_member(&self, member_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        let member = state
            .workspace_members
            .get(&member_id)
            .cloned()
            .ok_or_else(|| EngineError::UserNotFound(member_id.to_string()))?;
        if member.role == WorkspaceRole::Owner {
            let owners = state
                .workspace_members
                .values()
                .filter(|m| m.workspace_id == member.workspace_id && m.role == WorkspaceRole::Owner)
                .count();
            if owners <= 1 {
                return Err(EngineError::CannotRemoveOwner);
            }
        }
        state.workspace_members.remove(&member_id);
        Ok(())
    }

    async fn add_tenant_member(&self, member: &TenantMember) -> Result<()> {
        self.state
            .lock()
            .tenant_members
            .insert(member.id, member.clone());
        Ok(())
    }

    async fn tenant_members(&self, tenant_id: Uuid) -> Result<Vec<TenantMember>> {
        Ok(self
            .state
            .lock()
            .tenant_members
            .values()
            .filter(|m| m.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn memberships_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<(Vec<WorkspaceMember>, Vec<TenantMember>)> {
        let state = self.state.lock();
        let workspace = state
            .workspace_members
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        let tenant = state
            .tenant_members
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        Ok((workspace, tenant))
    }
}

#[async_trait]
impl AccessHistoryStore for MemoryStore {
    async fn record(&self, record: &AccessRecord) -> Result<()> {
        self.state.lock().access.push(record.clone());
        Ok(())
    }

    async fn recent(
        &self,
        user_id: Uuid,
        entity_type: AccessEntityType,
        limit: usize,
    ) -> Result<Vec<AccessRecord>> {
        let state = self.state.lock();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for record in state.access.iter().rev() {
            if record.user_id != user_id || record.entity_type != entity_type {
                continue;
            }
            if seen.insert(record.entity_id) {
                out.push(record.clone());
                if out.len() == limit {
                    break;
                }
            }
        }
        Ok(out)
    }
}
