use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

use crate::injectable::{DataType, FormatSpec, InjectableValue};
use crate::registry::InjectorRegistry;
use crate::{EngineError, Result};

/// One dynamic injectable offered by a workspace provider. Labels and
/// descriptions arrive pre-resolved for the requested locale.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderCode {
    pub code: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub data_type: DataType,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub formats: Option<FormatSpec>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderGroup {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
}

/// Everything a provider contributes to the editor listing.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderListing {
    pub codes: Vec<ProviderCode>,
    pub groups: Vec<ProviderGroup>,
}

/// The batched resolution request. Provider codes may only depend on
/// other codes of the same batch; ordering within the batch is the
/// provider's concern.
#[derive(Debug, Clone)]
pub struct ProviderResolveRequest {
    pub tenant_code: Option<String>,
    pub workspace_code: Option<String>,
    pub template_id: Option<Uuid>,
    pub codes: Vec<String>,
    pub selected_formats: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub payload: Option<serde_json::Value>,
    pub init_data: Option<serde_json::Value>,
}

/// Result of one batched resolve. `errors` entries are non-critical:
/// the resolver substitutes an empty value and logs them.
#[derive(Debug, Clone, Default)]
pub struct ProviderBatch {
    pub values: HashMap<String, InjectableValue>,
    pub errors: HashMap<String, String>,
}

/// Optional user-supplied collaborator contributing workspace-dynamic
/// injectables at runtime.
#[async_trait]
pub trait WorkspaceInjectableProvider: Send + Sync {
    async fn list_for(
        &self,
        tenant_code: Option<&str>,
        workspace_code: &str,
        locale: &str,
    ) -> Result<ProviderListing>;

    /// Resolves a whole batch in one call. A returned error is fatal to
    /// the render; per-code problems belong in `ProviderBatch::errors`.
    async fn resolve(&self, request: ProviderResolveRequest) -> Result<ProviderBatch>;
}

/// Rejects provider listings whose codes shadow registry codes. Run on
/// every editor-listing request before the two catalogs are merged.
pub fn check_collisions(registry: &InjectorRegistry, listing: &ProviderListing) -> Result<()> {
    for code in &listing.codes {
        if registry.contains(&code.code) {
            return Err(EngineError::CodeCollision(code.code.clone()));
        }
    }
    Ok(())
}
