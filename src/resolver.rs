pub mod context;

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::injectable::{DataType, InjectableValue, SourceType, WorkspaceInjectable};
use crate::provider::WorkspaceInjectableProvider;
use crate::registry::InjectorRegistry;
use crate::resolver::context::{InjectorContext, RequestIdentifiers};
use crate::{EngineError, Result};

/// Single-slot hook mapping the raw render body into the
/// `request_payload` every injector can read. Multiple document shapes
/// are distinguished inside one mapper, keeping the render entrypoint
/// uniform.
#[async_trait]
pub trait RequestMapper: Send + Sync {
    async fn map(
        &self,
        raw_body: &serde_json::Value,
        ctx: &InjectorContext,
    ) -> Result<serde_json::Value>;
}

/// Single-slot hook run once per render before any injector executes;
/// its product is exposed as `init_data`.
#[async_trait]
pub trait ContextInit: Send + Sync {
    async fn init(&self, ctx: &InjectorContext) -> Result<serde_json::Value>;
}

/// Everything one render request feeds into resolution.
pub struct ResolverInputs<'a> {
    /// Codes referenced by the version content.
    pub requested: BTreeSet<String>,
    /// The `injectables` object of the request body. Unknown codes are
    /// ignored.
    pub supplied: HashMap<String, serde_json::Value>,
    /// The raw request body, handed to the request mapper.
    pub raw_body: Option<serde_json::Value>,
    pub headers: HashMap<String, String>,
    pub selected_formats: HashMap<String, String>,
    pub identifiers: RequestIdentifiers,
    pub identity: Option<crate::auth::Identity>,
    pub tenant_code: Option<String>,
    pub workspace_code: Option<String>,
    pub locale: String,
    /// Workspace-owned definitions visible to the render's workspace.
    pub workspace_definitions: &'a [WorkspaceInjectable],
    /// Request deadline; every injector timeout is clipped to it.
    pub deadline: Instant,
}

/// The product of resolution: every effectively reachable code mapped to
/// its committed value, plus the context they were resolved in.
#[derive(Debug)]
pub struct ResolvedSet {
    pub values: HashMap<String, InjectableValue>,
    pub context: Arc<InjectorContext>,
}

impl ResolvedSet {
    pub fn get(&self, code: &str) -> Option<&InjectableValue> {
        self.values.get(code)
    }
}

/// Dependency-ordered evaluator turning declared injectables into
/// concrete typed values.
pub struct InjectorResolver {
    registry: Arc<InjectorRegistry>,
    mapper: Option<Arc<dyn RequestMapper>>,
    init: Option<Arc<dyn ContextInit>>,
    provider: Option<Arc<dyn WorkspaceInjectableProvider>>,
}

impl InjectorResolver {
    pub fn new(
        registry: Arc<InjectorRegistry>,
        mapper: Option<Arc<dyn RequestMapper>>,
        init: Option<Arc<dyn ContextInit>>,
        provider: Option<Arc<dyn WorkspaceInjectableProvider>>,
    ) -> Self {
        Self {
            registry,
            mapper,
            init,
            provider,
        }
    }

    pub fn registry(&self) -> &InjectorRegistry {
        &self.registry
    }

    /// Runs the four resolution phases: mapping, init, planning and
    /// level-ordered execution.
    pub async fn resolve(&self, inputs: ResolverInputs<'_>) -> Result<ResolvedSet> {
        let ctx = Arc::new(InjectorContext::new(
            inputs.identifiers,
            inputs.headers.clone(),
            inputs.identity,
            inputs.tenant_code.clone(),
            inputs.workspace_code.clone(),
            inputs.locale,
            inputs.selected_formats.clone(),
        ));

        // Phase A: mapping. Failure is always fatal.
        if let Some(mapper) = &self.mapper {
            let raw = inputs.raw_body.clone().unwrap_or(serde_json::Value::Null);
            let payload = mapper
                .map(&raw, &ctx)
                .await
                .map_err(|e| match e {
                    EngineError::MappingFailed(m) => EngineError::MappingFailed(m),
                    other => EngineError::MappingFailed(other.to_string()),
                })?;
            ctx.set_request_payload(payload);
        }

        // Phase B: init. Failure is fatal.
        if let Some(init) = &self.init {
            let data = init.init(&ctx).await?;
            ctx.set_init_data(data);
        }

        // Partition the requested codes by origin. Provider codes are
        // whatever the registry and the workspace definitions do not
        // claim; they resolve in one batched call.
        let mut registry_codes: Vec<String> = Vec::new();
        let mut workspace_codes: Vec<String> = Vec::new();
        let mut provider_codes: Vec<String> = Vec::new();
        let mut unknown: Vec<String> = Vec::new();
        for code in &inputs.requested {
            if self.registry.contains(code) {
                registry_codes.push(code.clone());
            } else if inputs.workspace_definitions.iter().any(|d| &d.key == code) {
                workspace_codes.push(code.clone());
            } else if self.provider.is_some() {
                provider_codes.push(code.clone());
            } else {
                unknown.push(code.clone());
            }
        }
        if !unknown.is_empty() {
            return Err(EngineError::MissingInjectables(unknown));
        }

        // Critical injectors are always part of the working set.
        for code in self.registry.critical_codes() {
            if !registry_codes.contains(&code) {
                registry_codes.push(code);
            }
        }

        // Phase C: plan. Cycles surface here, before any value work.
        let levels = self.registry.resolve_order(&registry_codes)?;

        // Parse caller-supplied values for every planned external code,
        // and fail fast on externals that are neither supplied nor
        // defaulted.
        let mut supplied_values: HashMap<String, InjectableValue> = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        for code in levels.iter().flatten() {
            let entry = self
                .registry
                .get(code)
                .ok_or_else(|| EngineError::InjectableNotFound(code.clone()))?;
            if entry.source_type != SourceType::External {
                continue;
            }
            match inputs.supplied.get(code) {
                Some(raw) => {
                    let value = InjectableValue::from_json(entry.data_type, raw)?;
                    supplied_values.insert(code.clone(), value);
                }
                None if entry.default_value.is_some() => {}
                None => missing.push(code.clone()),
            }
        }
        if !missing.is_empty() {
            missing.sort();
            return Err(EngineError::MissingInjectables(missing));
        }

        // Phase D: execute level by level. Within a level injectors run
        // concurrently; a level commits completely before the next
        // starts, so children observe final parent values.
        for level in &levels {
            let mut handles = Vec::with_capacity(level.len());
            for code in level {
                let entry = self.registry.get(code).cloned().ok_or_else(|| {
                    EngineError::InjectableNotFound(code.clone())
                })?;
                let supplied = supplied_values.remove(code);
                let ctx = Arc::clone(&ctx);
                let deadline = inputs.deadline;
                let code = code.clone();
                handles.push((code.clone(), entry.clone(), tokio::spawn(async move {
                    resolve_one(entry, supplied, ctx, deadline).await
                })));
            }
            for (code, entry, handle) in handles {
                let outcome = match handle.await {
                    Ok(result) => result,
                    Err(join_err) if join_err.is_panic() => {
                        Err(EngineError::Internal(format!("injector `{code}` panicked")))
                    }
                    Err(join_err) => Err(EngineError::Internal(join_err.to_string())),
                };
                match outcome {
                    Ok(value) => ctx.commit(code, value),
                    Err(cause) if entry.is_critical => {
                        return Err(EngineError::CriticalInjectorFailed {
                            code,
                            cause: cause.to_string(),
                        });
                    }
                    Err(cause) => {
                        warn!(code = %code, error = %cause, "non-critical injector failed, substituting default");
                        let fallback = entry
                            .default_value
                            .clone()
                            .unwrap_or_else(|| InjectableValue::zero(entry.data_type));
                        ctx.commit(code, fallback);
                    }
                }
            }
        }

        // Workspace-owned definitions: request override or stored default.
        for code in &workspace_codes {
            let def = inputs
                .workspace_definitions
                .iter()
                .find(|d| &d.key == code)
                .ok_or_else(|| EngineError::InjectableNotFound(code.clone()))?;
            let value = match inputs.supplied.get(code) {
                Some(raw) => InjectableValue::from_json(DataType::Text, raw)?,
                None => InjectableValue::Text(def.default_value.clone()),
            };
            ctx.commit(code.clone(), value);
        }

        // Provider codes: one batched call; per-code errors degrade,
        // a failed call is fatal.
        if !provider_codes.is_empty() {
            let provider = self
                .provider
                .as_ref()
                .ok_or_else(|| EngineError::MissingInjectables(provider_codes.clone()))?;
            let batch = provider
                .resolve(crate::provider::ProviderResolveRequest {
                    tenant_code: inputs.tenant_code.clone(),
                    workspace_code: inputs.workspace_code.clone(),
                    template_id: ctx.identifiers().template_id,
                    codes: provider_codes.clone(),
                    selected_formats: inputs.selected_formats.clone(),
                    headers: inputs.headers.clone(),
                    payload: ctx.request_payload(),
                    init_data: ctx.init_data(),
                })
                .await?;
            for code in &provider_codes {
                match batch.values.get(code) {
                    Some(value) => ctx.commit(code.clone(), value.clone()),
                    None => {
                        let msg = batch
                            .errors
                            .get(code)
                            .cloned()
                            .unwrap_or_else(|| "no value returned".to_string());
                        warn!(code = %code, error = %msg, "workspace provider left code unresolved");
                        ctx.commit(code.clone(), InjectableValue::Text(String::new()));
                    }
                }
            }
        }

        Ok(ResolvedSet {
            values: ctx.snapshot(),
            context: ctx,
        })
    }
}

/// Resolves one injector under its own timeout clipped to the request
/// deadline.
async fn resolve_one(
    entry: crate::registry::InjectorEntry,
    supplied: Option<InjectableValue>,
    ctx: Arc<InjectorContext>,
    deadline: Instant,
) -> Result<InjectableValue> {
    if entry.source_type == SourceType::External {
        return match supplied.or_else(|| entry.default_value.clone()) {
            Some(value) => Ok(value),
            None => Err(EngineError::MissingInjectables(vec![entry.code.clone()])),
        };
    }
    let resolve = entry
        .resolve
        .as_ref()
        .ok_or_else(|| EngineError::Internal(format!("injector `{}` has no resolver", entry.code)))?;
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(EngineError::Cancelled);
    }
    let budget = entry.timeout.min(remaining);
    match tokio::time::timeout(budget, resolve(ctx)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Internal(format!(
            "injector `{}` timed out after {budget:?}",
            entry.code
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injectable::FormatSpec;
    use crate::registry::InjectorEntry;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    fn inputs<'a>(
        requested: &[&str],
        supplied: &[(&str, serde_json::Value)],
        defs: &'a [WorkspaceInjectable],
    ) -> ResolverInputs<'a> {
        ResolverInputs {
            requested: requested.iter().map(|s| s.to_string()).collect(),
            supplied: supplied
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            raw_body: None,
            headers: HashMap::new(),
            selected_formats: HashMap::new(),
            identifiers: RequestIdentifiers::default(),
            identity: None,
            tenant_code: Some("ACME".to_string()),
            workspace_code: Some("MAIN".to_string()),
            locale: "en".to_string(),
            workspace_definitions: defs,
            deadline: Instant::now() + Duration::from_secs(5),
        }
    }

    fn resolver(registry: InjectorRegistry) -> InjectorResolver {
        InjectorResolver::new(Arc::new(registry), None, None, None)
    }

    #[tokio::test]
    async fn dependency_observes_committed_parent() {
        let mut builder = InjectorRegistry::builder();
        builder
            .register(InjectorEntry::internal("base", DataType::Number, |_| {
                Box::pin(async { Ok(InjectableValue::Number(21.0)) })
            }))
            .unwrap();
        builder
            .register(
                InjectorEntry::internal("double", DataType::Number, |ctx| {
                    Box::pin(async move {
                        match ctx.resolved("base") {
                            Some(InjectableValue::Number(n)) => {
                                Ok(InjectableValue::Number(n * 2.0))
                            }
                            _ => Err(EngineError::Internal("base unresolved".to_string())),
                        }
                    })
                })
                .with_dependencies(&["base"]),
            )
            .unwrap();

        let set = resolver(builder.build())
            .resolve(inputs(&["double"], &[], &[]))
            .await
            .unwrap();
        assert_eq!(set.get("double"), Some(&InjectableValue::Number(42.0)));
        assert_eq!(set.get("base"), Some(&InjectableValue::Number(21.0)));
    }

    #[tokio::test]
    async fn missing_externals_fail_before_execution() {
        let mut builder = InjectorRegistry::builder();
        builder
            .register(InjectorEntry::external("customer_name", DataType::Text))
            .unwrap();
        builder
            .register(InjectorEntry::external("order_id", DataType::Text))
            .unwrap();

        let err = resolver(builder.build())
            .resolve(inputs(&["customer_name", "order_id"], &[], &[]))
            .await
            .unwrap_err();
        match err {
            EngineError::MissingInjectables(codes) => {
                assert_eq!(codes, vec!["customer_name".to_string(), "order_id".to_string()]);
            }
            other => panic!("expected MissingInjectables, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn supplied_external_is_parsed_by_type() {
        let mut builder = InjectorRegistry::builder();
        builder
            .register(InjectorEntry::external("customer_name", DataType::Text))
            .unwrap();

        let set = resolver(builder.build())
            .resolve(inputs(
                &["customer_name"],
                &[("customer_name", serde_json::json!("Acme"))],
                &[],
            ))
            .await
            .unwrap();
        assert_eq!(
            set.get("customer_name"),
            Some(&InjectableValue::Text("Acme".to_string()))
        );
    }

    #[tokio::test]
    async fn critical_failure_aborts_render() {
        let mut builder = InjectorRegistry::builder();
        builder
            .register(
                InjectorEntry::internal("flaky", DataType::Text, |_| {
                    Box::pin(async { Err(EngineError::Internal("backend down".to_string())) })
                })
                .critical(),
            )
            .unwrap();

        let err = resolver(builder.build())
            .resolve(inputs(&["flaky"], &[], &[]))
            .await
            .unwrap_err();
        match err {
            EngineError::CriticalInjectorFailed { code, cause } => {
                assert_eq!(code, "flaky");
                assert!(cause.contains("backend down"));
            }
            other => panic!("expected CriticalInjectorFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_critical_failure_degrades_to_default() {
        let mut builder = InjectorRegistry::builder();
        builder
            .register(
                InjectorEntry::internal("with_default", DataType::Text, |_| {
                    Box::pin(async { Err(EngineError::Internal("nope".to_string())) })
                })
                .with_default(InjectableValue::Text("fallback".to_string())),
            )
            .unwrap();
        builder
            .register(InjectorEntry::internal("zeroed", DataType::Number, |_| {
                Box::pin(async { Err(EngineError::Internal("nope".to_string())) })
            }))
            .unwrap();

        let set = resolver(builder.build())
            .resolve(inputs(&["with_default", "zeroed"], &[], &[]))
            .await
            .unwrap();
        assert_eq!(
            set.get("with_default"),
            Some(&InjectableValue::Text("fallback".to_string()))
        );
        assert_eq!(set.get("zeroed"), Some(&InjectableValue::Number(0.0)));
    }

    #[tokio::test]
    async fn slow_injector_hits_its_own_timeout() {
        let mut builder = InjectorRegistry::builder();
        builder
            .register(
                InjectorEntry::internal("slow", DataType::Text, |_| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(InjectableValue::Text("late".to_string()))
                    })
                })
                .with_timeout(Duration::from_millis(20)),
            )
            .unwrap();

        let set = resolver(builder.build())
            .resolve(inputs(&["slow"], &[], &[]))
            .await
            .unwrap();
        assert_eq!(set.get("slow"), Some(&InjectableValue::Text(String::new())));
    }

    #[tokio::test]
    async fn cycle_fails_planning_without_partial_resolution() {
        let mut builder = InjectorRegistry::builder();
        builder
            .register(
                InjectorEntry::internal("a", DataType::Text, |_| {
                    Box::pin(async { Ok(InjectableValue::Text("a".to_string())) })
                })
                .with_dependencies(&["b"]),
            )
            .unwrap();
        builder
            .register(
                InjectorEntry::internal("b", DataType::Text, |_| {
                    Box::pin(async { Ok(InjectableValue::Text("b".to_string())) })
                })
                .with_dependencies(&["a"]),
            )
            .unwrap();

        let err = resolver(builder.build())
            .resolve(inputs(&["a"], &[], &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CircularDependency(_)));
    }

    #[tokio::test]
    async fn workspace_definition_resolves_to_stored_default() {
        let defs = vec![WorkspaceInjectable {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            key: "footer_note".to_string(),
            label: Default::default(),
            description: Default::default(),
            default_value: "Thank you".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }];
        let builder = InjectorRegistry::builder();
        let set = resolver(builder.build())
            .resolve(inputs(&["footer_note"], &[], &defs))
            .await
            .unwrap();
        assert_eq!(
            set.get("footer_note"),
            Some(&InjectableValue::Text("Thank you".to_string()))
        );

        let set = resolver(InjectorRegistry::builder().build())
            .resolve(inputs(
                &["footer_note"],
                &[("footer_note", serde_json::json!("Override"))],
                &defs,
            ))
            .await
            .unwrap();
        assert_eq!(
            set.get("footer_note"),
            Some(&InjectableValue::Text("Override".to_string()))
        );
    }

    #[tokio::test]
    async fn unknown_code_without_provider_is_missing() {
        let err = resolver(InjectorRegistry::builder().build())
            .resolve(inputs(&["ghost"], &[], &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingInjectables(codes) if codes == vec!["ghost"]));
    }

    #[test]
    fn format_selection_prefers_allowed_option() {
        let spec = FormatSpec {
            default: "%Y-%m-%d".to_string(),
            options: vec!["%Y-%m-%d".to_string(), "%d.%m.%Y".to_string()],
        };
        assert_eq!(spec.effective(Some("%d.%m.%Y")), Some("%d.%m.%Y"));
        assert_eq!(spec.effective(Some("%H:%M")), Some("%Y-%m-%d"));
    }
}
