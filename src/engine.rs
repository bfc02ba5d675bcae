use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{Identity, IdentityGate, RenderAuthenticator, RouteClass};
use crate::catalog::InjectorCatalog;
use crate::config::Settings;
use crate::lifecycle::VersionLifecycle;
use crate::provider::{ProviderListing, WorkspaceInjectableProvider, check_collisions};
use crate::registry::{InjectorEntry, InjectorRegistry, RegistryBuilder};
use crate::render::RenderOutput;
use crate::render::admission::AdmissionController;
use crate::render::cache::CompiledTemplateCache;
use crate::render::images::ImageCache;
use crate::render::pipeline::{RenderJob, RenderPipeline};
use crate::render::typesetter::Typesetter;
use crate::resolver::{ContextInit, InjectorResolver, RequestMapper};
use crate::store::memory::MemoryStore;
use crate::store::postgres::PostgresStore;
use crate::store::{
    AccessHistoryStore, AssignmentStore, ClassificationStore, Stores, TemplateStore, TenantStore,
    UserStore, VersionStore, WorkspaceInjectableStore,
};
use crate::template::{Template, TemplateVersion};
use crate::tenancy::{AccessEntityType, AccessRecord, SystemRole, User, Workspace};
use crate::{EngineError, Result};

/// Accumulates the process-wide collaborators during startup. Once
/// `build` returns, the registry and hook slots are frozen.
pub struct EngineBuilder {
    settings: Settings,
    registry: RegistryBuilder,
    mapper: Option<Arc<dyn RequestMapper>>,
    init: Option<Arc<dyn ContextInit>>,
    provider: Option<Arc<dyn WorkspaceInjectableProvider>>,
    render_authenticator: Option<Arc<dyn RenderAuthenticator>>,
    stores: Option<Stores>,
    catalog: Option<InjectorCatalog>,
}

impl EngineBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            registry: InjectorRegistry::builder(),
            mapper: None,
            init: None,
            provider: None,
            render_authenticator: None,
            stores: None,
            catalog: None,
        }
    }

    pub fn register_injector(mut self, entry: InjectorEntry) -> Result<Self> {
        self.registry.register(entry)?;
        Ok(self)
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn RequestMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn with_init(mut self, init: Arc<dyn ContextInit>) -> Self {
        self.init = Some(init);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn WorkspaceInjectableProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_render_authenticator(mut self, auth: Arc<dyn RenderAuthenticator>) -> Self {
        self.render_authenticator = Some(auth);
        self
    }

    /// Overrides the persistence ports; used by tests and ephemeral mode.
    pub fn with_stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn with_catalog(mut self, catalog: InjectorCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Wires the engine: typesetter preflight, store connection, catalog
    /// load and identity-gate setup.
    pub async fn build(self) -> Result<Engine> {
        let settings = self.settings;
        let typesetter = Arc::new(Typesetter::new(
            settings.typesetter.bin_path.clone(),
            settings.typesetter.font_dirs.clone(),
        ));
        let version = typesetter.probe()?;
        info!(typesetter = %version, "typesetter preflight ok");

        let (stores, postgres) = match self.stores {
            Some(stores) => (stores, None),
            None => {
                let pg = PostgresStore::connect(&settings.database).await?;
                (pg.stores(), Some(pg))
            }
        };

        let catalog = match (&self.catalog, &settings.catalog_path) {
            (Some(catalog), _) => catalog.clone(),
            (None, Some(path)) => InjectorCatalog::load(std::path::Path::new(path))?,
            (None, None) => InjectorCatalog::default(),
        };

        let registry = Arc::new(self.registry.build());
        for finding in catalog.lint(&registry) {
            warn!(%finding, "injector catalog");
        }

        let resolver = Arc::new(InjectorResolver::new(
            Arc::clone(&registry),
            self.mapper,
            self.init,
            self.provider.clone(),
        ));
        let images = Arc::new(ImageCache::new(&settings.typesetter)?);
        let pipeline = Arc::new(RenderPipeline::new(
            AdmissionController::new(settings.typesetter.max_concurrent),
            Arc::clone(&resolver),
            CompiledTemplateCache::new(
                settings.typesetter.template_cache_max,
                settings.typesetter.template_cache_ttl(),
            ),
            Arc::clone(&images),
            Arc::clone(&typesetter),
            settings.typesetter.acquire_timeout(),
            settings.typesetter.timeout(),
            settings.request_timeout(),
        ));
        let lifecycle = Arc::new(VersionLifecycle::new(
            stores.clone(),
            Arc::clone(&registry),
            self.provider.clone(),
        ));

        let http_client = reqwest::Client::new();
        let gate = Arc::new(
            IdentityGate::from_settings(
                &settings.auth,
                self.render_authenticator,
                &http_client,
            )
            .await?,
        );
        gate.refresh_keys().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = Engine {
            settings,
            registry,
            resolver,
            pipeline,
            lifecycle,
            gate,
            stores,
            postgres,
            catalog,
            typesetter,
            images,
            provider: self.provider,
            shutdown_tx,
            shutdown_rx,
            workers: parking_lot::Mutex::new(Vec::new()),
        };
        Ok(engine)
    }
}

/// The assembled engine: every core component plus the background
/// workers that keep it honest.
pub struct Engine {
    pub settings: Settings,
    registry: Arc<InjectorRegistry>,
    resolver: Arc<InjectorResolver>,
    pipeline: Arc<RenderPipeline>,
    lifecycle: Arc<VersionLifecycle>,
    gate: Arc<IdentityGate>,
    stores: Stores,
    postgres: Option<PostgresStore>,
    catalog: InjectorCatalog,
    typesetter: Arc<Typesetter>,
    images: Arc<ImageCache>,
    provider: Option<Arc<dyn WorkspaceInjectableProvider>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    workers: parking_lot::Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Engine {
    pub fn builder(settings: Settings) -> EngineBuilder {
        EngineBuilder::new(settings)
    }

    /// Builds an engine on the in-memory store, pairing with auth dummy
    /// mode for local development.
    pub fn ephemeral(settings: Settings) -> EngineBuilder {
        EngineBuilder::new(settings).with_stores(MemoryStore::new().stores())
    }

    pub fn registry(&self) -> &InjectorRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<InjectorResolver> {
        &self.resolver
    }

    pub fn lifecycle(&self) -> &Arc<VersionLifecycle> {
        &self.lifecycle
    }

    pub fn pipeline(&self) -> &Arc<RenderPipeline> {
        &self.pipeline
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn gate(&self) -> &Arc<IdentityGate> {
        &self.gate
    }

    pub fn catalog(&self) -> &InjectorCatalog {
        &self.catalog
    }

    /// Readiness: database ping plus typesetter probe.
    pub async fn readiness(&self) -> Result<()> {
        if let Some(pg) = &self.postgres {
            pg.ping().await?;
        }
        self.typesetter.probe()?;
        Ok(())
    }

    /// Starts the long-lived workers: scheduled publication, JWKS
    /// refresh and the image-cache sweeper.
    pub fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        let tick = Duration::from_secs(self.settings.server.scheduler_tick_seconds.max(1));
        workers.push((
            "scheduler",
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            match engine.lifecycle.tick(Utc::now()).await {
                                Ok(outcomes) => {
                                    for outcome in outcomes {
                                        engine.pipeline.invalidate_version(outcome.published.id);
                                    }
                                }
                                Err(error) => warn!(%error, "scheduler tick failed"),
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }),
        ));

        let gate = Arc::clone(&self.gate);
        let mut shutdown = self.shutdown_rx.clone();
        let refresh = Duration::from_secs(self.settings.auth.jwks_refresh_seconds.clamp(60, 3600));
        workers.push((
            "jwks-refresh",
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(refresh);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => gate.refresh_keys().await,
                        _ = shutdown.changed() => break,
                    }
                }
            }),
        ));

        let images = Arc::clone(&self.images);
        let mut shutdown = self.shutdown_rx.clone();
        let sweep = Duration::from_secs(
            self.settings.typesetter.image_cache_cleanup_seconds.max(1),
        );
        workers.push((
            "image-sweeper",
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(sweep);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let removed = images.sweep();
                            if removed > 0 {
                                info!(removed, "image cache swept");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }),
        ));
    }

    /// Stops background workers in LIFO start order.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut workers = std::mem::take(&mut *self.workers.lock());
        while let Some((name, handle)) = workers.pop() {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!(worker = name, "worker did not stop in time");
            }
        }
    }

    /// Authenticates a request and, on panel routes, provisions the user
    /// row (bootstrap grants SUPERADMIN on an empty user table).
    pub async fn authenticate(
        &self,
        route: RouteClass,
        authorization: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Result<Identity> {
        let mut identity = self.gate.authenticate(route, authorization, headers).await?;
        if route == RouteClass::Panel {
            let user = self.ensure_user(&identity).await?;
            identity.user_id = Some(user.id);
        }
        Ok(identity)
    }

    /// Finds or creates the user row behind an identity.
    pub async fn ensure_user(&self, identity: &Identity) -> Result<User> {
        if let Some(user) = self.stores.users.by_subject(&identity.subject).await? {
            return Ok(user);
        }
        let first = self.stores.users.count().await? == 0;
        let bootstrap =
            first && (self.settings.bootstrap.enabled || identity.is_dummy());
        let user = User {
            id: Uuid::new_v4(),
            subject: identity.subject.clone(),
            email: identity.email.clone(),
            display_name: identity.email.clone(),
            system_role: bootstrap.then_some(SystemRole::Superadmin),
            created_at: Utc::now(),
        };
        self.stores.users.insert(&user).await?;
        if bootstrap {
            info!(user = %user.id, "bootstrap: first login granted SUPERADMIN");
        }
        Ok(user)
    }

    pub async fn record_access(
        &self,
        user_id: Uuid,
        entity_type: AccessEntityType,
        entity_id: Uuid,
    ) -> Result<()> {
        self.stores
            .access_history
            .record(&AccessRecord {
                id: Uuid::new_v4(),
                user_id,
                entity_type,
                entity_id,
                accessed_at: Utc::now(),
            })
            .await
    }

    /// Resolves the render target for a production render: the workspace's
    /// published template of the given classification.
    pub async fn production_target(
        &self,
        workspace: &Workspace,
        classification_code: &str,
    ) -> Result<(Template, TemplateVersion)> {
        let tenant_id = workspace.tenant_id.ok_or_else(|| {
            EngineError::ClassificationNotFound(classification_code.to_string())
        })?;
        let classification = self
            .stores
            .classifications
            .by_code(tenant_id, classification_code)
            .await?
            .ok_or_else(|| {
                EngineError::ClassificationNotFound(classification_code.to_string())
            })?;
        for template in self.stores.templates.list_for_workspace(workspace.id).await? {
            if template.classification_id != Some(classification.id) {
                continue;
            }
            if let Some(version) = self
                .stores
                .versions
                .published_for_template(template.id)
                .await?
            {
                return Ok((template, version));
            }
        }
        Err(EngineError::TemplateNotFound(format!(
            "no published template for classification `{classification_code}`"
        )))
    }

    /// Runs a render for an already-located template/version pair.
    #[allow(clippy::too_many_arguments)]
    pub async fn render(
        &self,
        workspace: &Workspace,
        template: &Template,
        version: &TemplateVersion,
        classification_code: Option<String>,
        preview: bool,
        body: serde_json::Value,
        headers: HashMap<String, String>,
        identity: Option<Identity>,
        locale: String,
    ) -> Result<RenderOutput> {
        let supplied = body
            .get("injectables")
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>()
            })
            .unwrap_or_default();
        let selected_formats = body
            .get("formats")
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect::<HashMap<_, _>>()
            })
            .unwrap_or_default();
        let tenant_code = match workspace.tenant_id {
            Some(tenant_id) => self.stores.tenants.get(tenant_id).await?.map(|t| t.code),
            None => None,
        };
        let workspace_definitions = self
            .stores
            .workspace_injectables
            .list_for_workspace(workspace.id)
            .await?;

        self.pipeline
            .render(RenderJob {
                template,
                version,
                classification_code,
                locale,
                preview,
                supplied,
                raw_body: Some(body),
                headers,
                selected_formats,
                identity,
                tenant_code,
                workspace_code: Some(workspace.code.clone()),
                workspace_definitions,
            })
            .await
    }

    /// The editor's injectable palette for one workspace: visible system
    /// injectors (catalog-localized), workspace definitions and the
    /// provider's dynamic codes merged into one listing.
    pub async fn injectable_listing(
        &self,
        workspace: &Workspace,
        locale: &str,
    ) -> Result<ProviderListing> {
        let assignments = self.stores.assignments.relevant_to(workspace).await?;
        let visible = self.registry.visible_codes(&assignments);
        let mut listing = self.catalog.listing(&self.registry, &visible, locale);

        for def in self
            .stores
            .workspace_injectables
            .list_for_workspace(workspace.id)
            .await?
        {
            listing.codes.push(crate::provider::ProviderCode {
                code: def.key.clone(),
                label: crate::injectable::resolve_locale(&def.label, locale, &def.key)
                    .to_string(),
                description: crate::injectable::resolve_locale(&def.description, locale, "")
                    .to_string(),
                data_type: crate::injectable::DataType::Text,
                group: None,
                formats: None,
            });
        }

        if let Some(provider) = &self.provider {
            let tenant_code = match workspace.tenant_id {
                Some(tenant_id) => self.stores.tenants.get(tenant_id).await?.map(|t| t.code),
                None => None,
            };
            let dynamic = provider
                .list_for(tenant_code.as_deref(), &workspace.code, locale)
                .await?;
            check_collisions(&self.registry, &dynamic)?;
            listing.codes.extend(dynamic.codes);
            listing.groups.extend(dynamic.groups);
        }
        Ok(listing)
    }

    /// Refuses deletion of a workspace injectable that a non-archived
    /// version still references.
    pub async fn delete_workspace_injectable(&self, id: Uuid) -> Result<()> {
        let injectable = self
            .stores
            .workspace_injectables
            .get(id)
            .await?
            .ok_or_else(|| EngineError::InjectableNotFound(id.to_string()))?;
        for template in self
            .stores
            .templates
            .list_for_workspace(injectable.workspace_id)
            .await?
        {
            for version in self.stores.versions.list_for_template(template.id).await? {
                if version.state == crate::template::VersionState::Archived {
                    continue;
                }
                let referenced = version.content.as_ref().is_some_and(|c| {
                    c.injector_refs().iter().any(|r| r.code == injectable.key)
                });
                if referenced {
                    return Err(EngineError::Validation(format!(
                        "injectable `{}` is referenced by version {} of template `{}`",
                        injectable.key, version.version_number, template.name
                    )));
                }
            }
        }
        self.stores.workspace_injectables.delete(id).await
    }
}
