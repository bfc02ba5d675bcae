use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::injectable::{LocaleMap, resolve_locale};
use crate::provider::{ProviderCode, ProviderGroup, ProviderListing};
use crate::registry::InjectorRegistry;
use crate::{EngineError, Result};

/// A display group for the editor's injectable palette.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogGroup {
    pub key: String,
    #[serde(default)]
    pub name: LocaleMap,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
}

/// Per-injector presentation overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CatalogInjector {
    #[serde(default)]
    pub label: LocaleMap,
    #[serde(default)]
    pub description: LocaleMap,
    #[serde(default)]
    pub group: Option<String>,
}

/// The startup-time injector catalog file: groups plus i18n labels and
/// descriptions layered over the code-declared registry entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InjectorCatalog {
    #[serde(default)]
    pub groups: Vec<CatalogGroup>,
    #[serde(default)]
    pub injectors: BTreeMap<String, CatalogInjector>,
}

impl InjectorCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_str(&raw)
    }

    pub fn from_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| EngineError::Catalog(e.to_string()))
    }

    pub fn group(&self, key: &str) -> Option<&CatalogGroup> {
        self.groups.iter().find(|g| g.key == key)
    }

    /// Non-fatal catalog problems: group references that resolve to no
    /// declared group, and labels for codes the registry does not know.
    pub fn lint(&self, registry: &InjectorRegistry) -> Vec<String> {
        let mut findings = Vec::new();
        for (code, inj) in &self.injectors {
            if !registry.contains(code) {
                findings.push(format!("catalog entry `{code}` has no registered injector"));
            }
            if let Some(group) = &inj.group {
                if self.group(group).is_none() {
                    findings.push(format!("catalog entry `{code}` references unknown group `{group}`"));
                }
            }
        }
        for entry in registry.entries() {
            if let Some(group) = &entry.group {
                if self.group(group).is_none() {
                    findings.push(format!(
                        "injector `{}` references unknown group `{group}`",
                        entry.code
                    ));
                }
            }
        }
        findings
    }

    /// Builds the locale-resolved editor listing for the registry codes
    /// in `visible`. Group references are resolved here, at listing
    /// time; catalog labels take precedence over code-declared ones.
    pub fn listing(
        &self,
        registry: &InjectorRegistry,
        visible: &std::collections::BTreeSet<String>,
        locale: &str,
    ) -> ProviderListing {
        let mut codes: Vec<ProviderCode> = Vec::new();
        for entry in registry.entries() {
            if !visible.contains(&entry.code) {
                continue;
            }
            let overlay = self.injectors.get(&entry.code);
            let label_map = overlay
                .map(|o| &o.label)
                .filter(|m| !m.is_empty())
                .unwrap_or(&entry.label);
            let description_map = overlay
                .map(|o| &o.description)
                .filter(|m| !m.is_empty())
                .unwrap_or(&entry.description);
            let group = overlay
                .and_then(|o| o.group.clone())
                .or_else(|| entry.group.clone());
            codes.push(ProviderCode {
                code: entry.code.clone(),
                label: resolve_locale(label_map, locale, &entry.code).to_string(),
                description: resolve_locale(description_map, locale, "").to_string(),
                data_type: entry.data_type,
                group,
                formats: entry.formats.clone(),
            });
        }

        let mut groups: Vec<ProviderGroup> = self
            .groups
            .iter()
            .map(|g| ProviderGroup {
                key: g.key.clone(),
                name: resolve_locale(&g.name, locale, &g.key).to_string(),
                icon: g.icon.clone(),
                sort_order: g.sort_order,
            })
            .collect();
        groups.sort_by_key(|g| g.sort_order);
        ProviderListing { codes, groups }
    }
}
