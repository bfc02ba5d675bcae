use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::Result;

/// Top-level service configuration, loaded from YAML with environment
/// overrides (prefix `DOC_ENGINE_`, nested keys separated by `_`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub auth: AuthSettings,
    pub logging: LoggingSettings,
    pub typesetter: TypesetterSettings,
    pub bootstrap: BootstrapSettings,
    /// Optional path to the injector catalog file (groups + i18n labels).
    pub catalog_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Route prefix for the API surface.
    pub base_path: String,
    pub request_timeout_seconds: u64,
    /// Period of the scheduled-publication tick.
    pub scheduler_tick_seconds: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_path: "/api/v1".to_string(),
            request_timeout_seconds: 60,
            scheduler_tick_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub ssl_mode: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "docsmith".to_string(),
            password: String::new(),
            name: "docsmith".to_string(),
            ssl_mode: "prefer".to_string(),
            max_connections: 10,
            min_connections: 1,
        }
    }
}

impl DatabaseSettings {
    /// Connection string for sqlx, without logging the password.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.name, self.ssl_mode
        )
    }
}

/// One OIDC provider. Either `discovery_url` or both `issuer` and
/// `jwks_url` must be set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderSettings {
    pub name: String,
    pub discovery_url: Option<String>,
    pub issuer: Option<String>,
    pub jwks_url: Option<String>,
    pub audience: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// The provider trusted on panel (administrative) routes. When absent
    /// the gate runs in dummy mode: a synthetic SUPERADMIN identity.
    pub panel: Option<ProviderSettings>,
    /// Additional providers accepted on render routes only.
    pub render_providers: Vec<ProviderSettings>,
    pub jwks_refresh_seconds: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            panel: None,
            render_providers: Vec::new(),
            jwks_refresh_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// `plain` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TypesetterSettings {
    pub bin_path: String,
    pub timeout_seconds: u64,
    pub font_dirs: Vec<String>,
    /// Concurrent render slots. 0 means unbounded.
    pub max_concurrent: usize,
    pub acquire_timeout_seconds: u64,
    pub template_cache_ttl_seconds: u64,
    pub template_cache_max: usize,
    /// Empty means a process-private ephemeral directory.
    pub image_cache_dir: String,
    pub image_cache_max_age_seconds: u64,
    pub image_cache_cleanup_seconds: u64,
    pub image_fetch_timeout_seconds: u64,
    pub image_max_bytes: u64,
}

impl Default for TypesetterSettings {
    fn default() -> Self {
        Self {
            bin_path: "typst".to_string(),
            timeout_seconds: 30,
            font_dirs: Vec::new(),
            max_concurrent: 4,
            acquire_timeout_seconds: 10,
            template_cache_ttl_seconds: 300,
            template_cache_max: 256,
            image_cache_dir: String::new(),
            image_cache_max_age_seconds: 86_400,
            image_cache_cleanup_seconds: 600,
            image_fetch_timeout_seconds: 10,
            image_max_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BootstrapSettings {
    /// When true, the first authenticated panel login on an empty user
    /// table is granted SUPERADMIN.
    pub enabled: bool,
}

impl Settings {
    /// Loads settings from an optional YAML file layered under
    /// `DOC_ENGINE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let cfg = builder
            .add_source(Environment::with_prefix("DOC_ENGINE").separator("_"))
            .build()?;
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Structural checks that cannot be expressed through serde alone.
    pub fn validate(&self) -> Result<()> {
        if let Some(panel) = &self.auth.panel {
            panel.validate("auth.panel")?;
        }
        for (i, p) in self.auth.render_providers.iter().enumerate() {
            p.validate(&format!("auth.render_providers[{i}]"))?;
        }
        if self.typesetter.timeout_seconds == 0 {
            return Err(crate::EngineError::Validation(
                "typesetter.timeout_seconds must be positive".to_string(),
            ));
        }
        if self.logging.format != "plain" && self.logging.format != "json" {
            return Err(crate::EngineError::Validation(format!(
                "logging.format must be `plain` or `json`, got `{}`",
                self.logging.format
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_seconds)
    }
}

impl ProviderSettings {
    fn validate(&self, at: &str) -> Result<()> {
        if self.name.is_empty() {
            return Err(crate::EngineError::Validation(format!(
                "{at}.name must not be empty"
            )));
        }
        let discovered = self.discovery_url.is_some();
        let explicit = self.issuer.is_some() && self.jwks_url.is_some();
        if !discovered && !explicit {
            return Err(crate::EngineError::Validation(format!(
                "{at} needs either discovery_url or issuer + jwks_url"
            )));
        }
        Ok(())
    }
}

impl TypesetterSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn template_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.template_cache_ttl_seconds)
    }

    pub fn image_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.image_fetch_timeout_seconds)
    }

    pub fn image_cache_max_age(&self) -> Duration {
        Duration::from_secs(self.image_cache_max_age_seconds)
    }
}
