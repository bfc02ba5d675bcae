use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::content::ContentStructure;
use crate::injectable::DataType;
use crate::provider::WorkspaceInjectableProvider;
use crate::registry::InjectorRegistry;
use crate::store::{
    AssignmentStore, ClassificationStore, PublishOutcome, Stores, TemplateStore, TenantStore,
    VersionStore, WorkspaceInjectableStore, WorkspaceStore,
};
use crate::template::{TemplateVersion, VersionState};
use crate::tenancy::Workspace;
use crate::validator::{ValidationCatalog, validate_content};
use crate::{EngineError, Result};

/// Bounded retries for optimistic-lock races between explicit publish
/// and the scheduler tick.
const LOCK_ATTEMPTS: usize = 2;

/// A content/metadata change applied to a DRAFT version.
#[derive(Debug, Clone, Default)]
pub struct VersionEdit {
    pub name: Option<String>,
    pub content: Option<ContentStructure>,
}

/// Drives the DRAFT→SCHEDULED→PUBLISHED→ARCHIVED state machine over the
/// persistence ports.
pub struct VersionLifecycle {
    stores: Stores,
    registry: Arc<InjectorRegistry>,
    provider: Option<Arc<dyn WorkspaceInjectableProvider>>,
}

impl VersionLifecycle {
    pub fn new(
        stores: Stores,
        registry: Arc<InjectorRegistry>,
        provider: Option<Arc<dyn WorkspaceInjectableProvider>>,
    ) -> Self {
        Self {
            stores,
            registry,
            provider,
        }
    }

    async fn load_version(&self, version_id: Uuid) -> Result<TemplateVersion> {
        self.stores
            .versions
            .get(version_id)
            .await?
            .ok_or_else(|| EngineError::VersionNotFound(version_id.to_string()))
    }

    /// Creates a new DRAFT, optionally seeded from an existing version
    /// of the same template.
    pub async fn create_draft(
        &self,
        template_id: Uuid,
        base: Option<Uuid>,
        created_by: Option<Uuid>,
    ) -> Result<TemplateVersion> {
        let template = self
            .stores
            .templates
            .get(template_id)
            .await?
            .ok_or_else(|| EngineError::TemplateNotFound(template_id.to_string()))?;
        let number = self.stores.versions.next_version_number(template.id).await?;
        let mut version = TemplateVersion::new_draft(template.id, number, created_by);
        if let Some(base_id) = base {
            let base = self.load_version(base_id).await?;
            if base.template_id != template.id {
                return Err(EngineError::Validation(
                    "base version belongs to another template".to_string(),
                ));
            }
            version.content = base.content;
            version.name = base.name;
        }
        self.stores.versions.insert(&version).await?;
        Ok(version)
    }

    /// Applies an edit; only DRAFT versions accept one.
    pub async fn edit(&self, version_id: Uuid, edit: VersionEdit) -> Result<TemplateVersion> {
        let mut version = self.load_version(version_id).await?;
        if !version.state.allows_edit() {
            return Err(EngineError::CannotEditInState(version.state));
        }
        let expected = version.updated_at;
        if let Some(name) = edit.name {
            version.name = Some(name);
        }
        if let Some(content) = edit.content {
            version.content = Some(content);
        }
        self.stores.versions.update(&version, expected).await?;
        self.load_version(version_id).await
    }

    /// Publishes a DRAFT: validates content, enforces the
    /// per-classification gate and atomically archives the previously
    /// published sibling.
    pub async fn publish(&self, version_id: Uuid) -> Result<PublishOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let version = self.load_version(version_id).await?;
            match version.state {
                VersionState::Draft => {}
                VersionState::Published => return Err(EngineError::VersionAlreadyPublished),
                state => return Err(EngineError::CannotEditInState(state)),
            }
            self.publish_gates(&version).await?;
            match self
                .stores
                .versions
                .publish_swap(version.id, version.updated_at, Utc::now())
                .await
            {
                Ok(outcome) => {
                    info!(version = %outcome.published.id, "version published");
                    return Ok(outcome);
                }
                Err(EngineError::OptimisticLock) if attempt < LOCK_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// The publish guards shared by explicit publish and the scheduler
    /// fire: non-empty content, clean validation, classification gate.
    async fn publish_gates(&self, version: &TemplateVersion) -> Result<()> {
        if !version.has_content() {
            return Err(EngineError::EmptyContent);
        }
        let template = self
            .stores
            .templates
            .get(version.template_id)
            .await?
            .ok_or_else(|| EngineError::TemplateNotFound(version.template_id.to_string()))?;
        let workspace = self
            .stores
            .workspaces
            .get(template.workspace_id)
            .await?
            .ok_or_else(|| EngineError::WorkspaceNotFound(template.workspace_id.to_string()))?;

        if let Some(classification_id) = template.classification_id {
            if let Some(other) = self
                .stores
                .templates
                .published_for_classification(workspace.id, classification_id, template.id)
                .await?
            {
                let classification = self
                    .stores
                    .classifications
                    .get(classification_id)
                    .await?
                    .map(|c| c.code)
                    .unwrap_or_else(|| classification_id.to_string());
                warn!(blocking_template = %other, "publish refused by classification gate");
                return Err(EngineError::ClassificationConflict(classification));
            }
        }

        let catalog = self.validation_catalog(&workspace).await?;
        let content = version.content.as_ref().ok_or(EngineError::EmptyContent)?;
        let report = validate_content(content, &catalog, &self.registry);
        if !report.is_clean() {
            return Err(EngineError::ContentValidation(report));
        }
        Ok(())
    }

    /// Every injectable code visible to the workspace, with its type:
    /// visible registry codes, workspace-owned definitions and the
    /// provider's dynamic codes.
    pub async fn validation_catalog(&self, workspace: &Workspace) -> Result<ValidationCatalog> {
        let mut catalog = ValidationCatalog::default();
        let assignments = self.stores.assignments.relevant_to(workspace).await?;
        for code in self.registry.visible_codes(&assignments) {
            if let Some(entry) = self.registry.get(&code) {
                catalog.types.insert(code, entry.data_type);
            }
        }
        for def in self
            .stores
            .workspace_injectables
            .list_for_workspace(workspace.id)
            .await?
        {
            catalog.types.insert(def.key, DataType::Text);
        }
        if let Some(provider) = &self.provider {
            let tenant_code = match workspace.tenant_id {
                Some(tenant_id) => self
                    .stores
                    .tenants
                    .get(tenant_id)
                    .await?
                    .map(|t| t.code),
                None => None,
            };
            let listing = provider
                .list_for(tenant_code.as_deref(), &workspace.code, "en")
                .await?;
            crate::provider::check_collisions(&self.registry, &listing)?;
            for code in listing.codes {
                catalog.types.insert(code.code, code.data_type);
            }
        }
        Ok(catalog)
    }

    /// Schedules a DRAFT for future publication.
    pub async fn schedule(&self, version_id: Uuid, at: DateTime<Utc>) -> Result<TemplateVersion> {
        let mut version = self.load_version(version_id).await?;
        match version.state {
            VersionState::Draft => {}
            state => return Err(EngineError::CannotEditInState(state)),
        }
        if at <= Utc::now() {
            return Err(EngineError::ScheduledTimeInPast);
        }
        let siblings = self
            .stores
            .versions
            .scheduled_for_template(version.template_id)
            .await?;
        if siblings
            .iter()
            .any(|s| s.id != version.id && s.scheduled_at == Some(at))
        {
            return Err(EngineError::ScheduledTimeConflict);
        }
        let expected = version.updated_at;
        version.state = VersionState::Scheduled;
        version.scheduled_at = Some(at);
        self.stores.versions.update(&version, expected).await?;
        self.load_version(version_id).await
    }

    /// Returns a SCHEDULED version to DRAFT, clearing its fire time.
    pub async fn cancel_schedule(&self, version_id: Uuid) -> Result<TemplateVersion> {
        let mut version = self.load_version(version_id).await?;
        match version.state {
            VersionState::Scheduled => {}
            state => return Err(EngineError::CannotEditInState(state)),
        }
        let expected = version.updated_at;
        version.state = VersionState::Draft;
        version.scheduled_at = None;
        self.stores.versions.update(&version, expected).await?;
        self.load_version(version_id).await
    }

    /// Archives a PUBLISHED version. Without `force` the template must
    /// have a scheduled replacement lined up.
    pub async fn archive(&self, version_id: Uuid, force: bool) -> Result<TemplateVersion> {
        let mut version = self.load_version(version_id).await?;
        match version.state {
            VersionState::Published => {}
            state => return Err(EngineError::CannotEditInState(state)),
        }
        if !force {
            let replacements = self
                .stores
                .versions
                .scheduled_for_template(version.template_id)
                .await?;
            if replacements.is_empty() {
                return Err(EngineError::Validation(
                    "archiving the published version needs a scheduled replacement or force"
                        .to_string(),
                ));
            }
        }
        let expected = version.updated_at;
        version.state = VersionState::Archived;
        version.archived_at = Some(Utc::now());
        self.stores.versions.update(&version, expected).await?;
        self.load_version(version_id).await
    }

    /// One scheduler pass: fires every SCHEDULED version whose time has
    /// come. Guard failures send the version back to DRAFT instead of
    /// retrying forever; lock losers retry once then report.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<PublishOutcome>> {
        let due = self.stores.versions.due_scheduled(now).await?;
        let mut outcomes = Vec::new();
        for candidate in due {
            match self.fire_scheduled(candidate.id, now).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(error) => {
                    warn!(version = %candidate.id, %error, "scheduled publication failed");
                }
            }
        }
        Ok(outcomes)
    }

    async fn fire_scheduled(
        &self,
        version_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PublishOutcome>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let version = self.load_version(version_id).await?;
            if version.state != VersionState::Scheduled
                || version.scheduled_at.is_none_or(|t| t > now)
            {
                // A competing tick or an explicit cancel got here first.
                return Ok(None);
            }
            if let Err(error) = self.publish_gates(&version).await {
                warn!(version = %version.id, %error, "scheduled version failed publish gates, reverting to draft");
                let expected = version.updated_at;
                let mut reverted = version;
                reverted.state = VersionState::Draft;
                reverted.scheduled_at = None;
                self.stores.versions.update(&reverted, expected).await?;
                return Ok(None);
            }
            match self
                .stores
                .versions
                .publish_swap(version.id, version.updated_at, now)
                .await
            {
                Ok(outcome) => {
                    info!(version = %outcome.published.id, "scheduled version published");
                    return Ok(Some(outcome));
                }
                Err(EngineError::OptimisticLock) if attempt < LOCK_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Node;
    use crate::store::memory::MemoryStore;
    use crate::template::Template;
    use crate::tenancy::{WorkspaceStatus, WorkspaceType};

    struct Fixture {
        lifecycle: VersionLifecycle,
        stores: Stores,
        template: Template,
    }

    async fn fixture() -> Fixture {
        fixture_with_registry(InjectorRegistry::builder().build()).await
    }

    async fn fixture_with_registry(registry: InjectorRegistry) -> Fixture {
        let memory = MemoryStore::new();
        let stores = memory.stores();
        let workspace = Workspace {
            id: Uuid::new_v4(),
            tenant_id: None,
            code: "MAIN".to_string(),
            name: "Main".to_string(),
            workspace_type: WorkspaceType::Client,
            status: WorkspaceStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        stores.workspaces.insert(&workspace).await.unwrap();
        let template = Template {
            id: Uuid::new_v4(),
            workspace_id: workspace.id,
            folder_id: None,
            classification_id: None,
            name: "Invoice".to_string(),
            description: String::new(),
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        stores.templates.insert(&template).await.unwrap();
        let lifecycle = VersionLifecycle::new(stores.clone(), Arc::new(registry), None);
        Fixture {
            lifecycle,
            stores,
            template,
        }
    }

    fn plain_content() -> ContentStructure {
        ContentStructure::new(Node::Doc {
            content: vec![Node::paragraph("Terms and conditions.")],
        })
    }

    #[tokio::test]
    async fn draft_edit_publish_swap() {
        let fx = fixture().await;
        let v1 = fx
            .lifecycle
            .create_draft(fx.template.id, None, None)
            .await
            .unwrap();
        assert_eq!(v1.version_number, 1);

        fx.lifecycle
            .edit(
                v1.id,
                VersionEdit {
                    name: Some("first".to_string()),
                    content: Some(plain_content()),
                },
            )
            .await
            .unwrap();
        let outcome = fx.lifecycle.publish(v1.id).await.unwrap();
        assert!(outcome.archived.is_none());

        // Publishing the same version again is refused.
        let err = fx.lifecycle.publish(v1.id).await.unwrap_err();
        assert!(matches!(err, EngineError::VersionAlreadyPublished));

        // A second draft swaps atomically.
        let v2 = fx
            .lifecycle
            .create_draft(fx.template.id, Some(v1.id), None)
            .await
            .unwrap();
        assert_eq!(v2.version_number, 2);
        let outcome = fx.lifecycle.publish(v2.id).await.unwrap();
        assert_eq!(outcome.archived.as_ref().unwrap().id, v1.id);
        assert_eq!(
            fx.stores.versions.get(v1.id).await.unwrap().unwrap().state,
            VersionState::Archived
        );
    }

    #[tokio::test]
    async fn publish_requires_content_and_clean_validation() {
        let fx = fixture().await;
        let empty = fx
            .lifecycle
            .create_draft(fx.template.id, None, None)
            .await
            .unwrap();
        assert!(matches!(
            fx.lifecycle.publish(empty.id).await.unwrap_err(),
            EngineError::EmptyContent
        ));

        let bad = fx
            .lifecycle
            .create_draft(fx.template.id, None, None)
            .await
            .unwrap();
        fx.lifecycle
            .edit(
                bad.id,
                VersionEdit {
                    name: None,
                    content: Some(ContentStructure::new(Node::Doc {
                        content: vec![Node::Injector {
                            attrs: crate::content::InjectorAttrs {
                                variable_id: "ghost".to_string(),
                                format: None,
                            },
                        }],
                    })),
                },
            )
            .await
            .unwrap();
        match fx.lifecycle.publish(bad.id).await.unwrap_err() {
            EngineError::ContentValidation(report) => {
                assert_eq!(report.errors[0].code, "UNKNOWN_INJECTABLE");
            }
            other => panic!("expected ContentValidation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn published_and_scheduled_reject_edits() {
        let fx = fixture().await;
        let v = fx
            .lifecycle
            .create_draft(fx.template.id, None, None)
            .await
            .unwrap();
        fx.lifecycle
            .edit(
                v.id,
                VersionEdit {
                    name: None,
                    content: Some(plain_content()),
                },
            )
            .await
            .unwrap();
        fx.lifecycle.publish(v.id).await.unwrap();
        let err = fx
            .lifecycle
            .edit(v.id, VersionEdit::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::CannotEditInState(VersionState::Published)
        ));
    }

    #[tokio::test]
    async fn schedule_guards_time_and_conflicts() {
        let fx = fixture().await;
        let v1 = fx
            .lifecycle
            .create_draft(fx.template.id, None, None)
            .await
            .unwrap();
        let v2 = fx
            .lifecycle
            .create_draft(fx.template.id, None, None)
            .await
            .unwrap();

        let past = Utc::now() - chrono::Duration::minutes(5);
        assert!(matches!(
            fx.lifecycle.schedule(v1.id, past).await.unwrap_err(),
            EngineError::ScheduledTimeInPast
        ));

        let at = Utc::now() + chrono::Duration::hours(1);
        fx.lifecycle.schedule(v1.id, at).await.unwrap();
        assert!(matches!(
            fx.lifecycle.schedule(v2.id, at).await.unwrap_err(),
            EngineError::ScheduledTimeConflict
        ));

        // A different instant on the same template is fine.
        fx.lifecycle
            .schedule(v2.id, at + chrono::Duration::minutes(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_restores_draft_metadata() {
        let fx = fixture().await;
        let v = fx
            .lifecycle
            .create_draft(fx.template.id, None, None)
            .await
            .unwrap();
        let edited = fx
            .lifecycle
            .edit(
                v.id,
                VersionEdit {
                    name: Some("winter".to_string()),
                    content: Some(plain_content()),
                },
            )
            .await
            .unwrap();

        let at = Utc::now() + chrono::Duration::hours(2);
        fx.lifecycle.schedule(v.id, at).await.unwrap();
        let back = fx.lifecycle.cancel_schedule(v.id).await.unwrap();
        assert_eq!(back.state, VersionState::Draft);
        assert_eq!(back.scheduled_at, None);
        assert_eq!(back.name, edited.name);
        assert_eq!(back.content, edited.content);
    }

    #[tokio::test]
    async fn archive_needs_replacement_or_force() {
        let fx = fixture().await;
        let v1 = fx
            .lifecycle
            .create_draft(fx.template.id, None, None)
            .await
            .unwrap();
        fx.lifecycle
            .edit(
                v1.id,
                VersionEdit {
                    name: None,
                    content: Some(plain_content()),
                },
            )
            .await
            .unwrap();
        fx.lifecycle.publish(v1.id).await.unwrap();

        assert!(fx.lifecycle.archive(v1.id, false).await.is_err());

        let v2 = fx
            .lifecycle
            .create_draft(fx.template.id, Some(v1.id), None)
            .await
            .unwrap();
        fx.lifecycle
            .schedule(v2.id, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        let archived = fx.lifecycle.archive(v1.id, false).await.unwrap();
        assert_eq!(archived.state, VersionState::Archived);
    }

    #[tokio::test]
    async fn tick_fires_due_schedules_and_clears_fire_time() {
        let fx = fixture().await;
        let v1 = fx
            .lifecycle
            .create_draft(fx.template.id, None, None)
            .await
            .unwrap();
        fx.lifecycle
            .edit(
                v1.id,
                VersionEdit {
                    name: None,
                    content: Some(plain_content()),
                },
            )
            .await
            .unwrap();
        fx.lifecycle.publish(v1.id).await.unwrap();

        let v2 = fx
            .lifecycle
            .create_draft(fx.template.id, Some(v1.id), None)
            .await
            .unwrap();
        fx.lifecycle
            .schedule(v2.id, Utc::now() + chrono::Duration::milliseconds(100))
            .await
            .unwrap();

        // A tick before the fire time may or may not be early enough;
        // only the total count matters.
        let outcomes = fx.lifecycle.tick(Utc::now()).await.unwrap();
        let fired_now = outcomes.len();

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let outcomes = fx
            .lifecycle
            .tick(Utc::now())
            .await
            .unwrap();
        assert_eq!(fired_now + outcomes.len(), 1);

        let published = fx.stores.versions.get(v2.id).await.unwrap().unwrap();
        assert_eq!(published.state, VersionState::Published);
        assert_eq!(published.scheduled_at, None);
        let archived = fx.stores.versions.get(v1.id).await.unwrap().unwrap();
        assert_eq!(archived.state, VersionState::Archived);
    }

    #[tokio::test]
    async fn classification_gate_blocks_second_template() {
        let fx = fixture().await;
        let classification_id = Uuid::new_v4();
        fx.stores
            .classifications
            .insert(&crate::template::DocumentClassification {
                id: classification_id,
                tenant_id: Uuid::new_v4(),
                code: "INVOICE".to_string(),
                name: Default::default(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut first = fx.template.clone();
        first.classification_id = Some(classification_id);
        fx.stores.templates.update(&first).await.unwrap();

        let v1 = fx
            .lifecycle
            .create_draft(first.id, None, None)
            .await
            .unwrap();
        fx.lifecycle
            .edit(
                v1.id,
                VersionEdit {
                    name: None,
                    content: Some(plain_content()),
                },
            )
            .await
            .unwrap();
        fx.lifecycle.publish(v1.id).await.unwrap();

        let second = Template {
            id: Uuid::new_v4(),
            classification_id: Some(classification_id),
            ..first.clone()
        };
        fx.stores.templates.insert(&second).await.unwrap();
        let v2 = fx
            .lifecycle
            .create_draft(second.id, None, None)
            .await
            .unwrap();
        fx.lifecycle
            .edit(
                v2.id,
                VersionEdit {
                    name: None,
                    content: Some(plain_content()),
                },
            )
            .await
            .unwrap();
        let err = fx.lifecycle.publish(v2.id).await.unwrap_err();
        assert!(matches!(err, EngineError::ClassificationConflict(code) if code == "INVOICE"));
    }
}
