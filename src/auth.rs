pub mod jwks;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::config::{AuthSettings, ProviderSettings};
use crate::auth::jwks::JwksCache;
use crate::{EngineError, Result};

/// The authenticated caller, propagated into the HTTP context and the
/// injector context.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Database user id, filled in once the user row is known.
    pub user_id: Option<Uuid>,
    pub subject: String,
    pub email: String,
    pub provider: String,
    pub extra: HashMap<String, serde_json::Value>,
}

impl Identity {
    /// The fixed identity injected in dummy mode.
    pub fn dummy() -> Self {
        Self {
            user_id: None,
            subject: "dummy-superadmin".to_string(),
            email: "dev@localhost".to_string(),
            provider: "dummy".to_string(),
            extra: HashMap::new(),
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.provider == "dummy"
    }
}

/// Route classes with different trust rules: panel accepts only the
/// panel provider; render accepts panel plus any render provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Panel,
    Render,
}

/// Programmatic replacement for OIDC on render routes. Panel routes
/// always stay on OIDC.
#[async_trait]
pub trait RenderAuthenticator: Send + Sync {
    async fn authenticate(
        &self,
        authorization: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Result<Identity>;
}

struct OidcProvider {
    name: String,
    issuer: String,
    audience: Option<String>,
    jwks: JwksCache,
}

impl OidcProvider {
    /// Resolves provider settings into issuer + JWKS endpoint, following
    /// the discovery document when one is configured.
    async fn from_settings(settings: &ProviderSettings, client: &reqwest::Client) -> Result<Self> {
        let (issuer, jwks_url) = match (&settings.discovery_url, &settings.issuer, &settings.jwks_url) {
            (Some(discovery), _, _) => {
                #[derive(Deserialize)]
                struct Discovery {
                    issuer: String,
                    jwks_uri: String,
                }
                let doc: Discovery = client
                    .get(discovery)
                    .send()
                    .await
                    .map_err(|e| EngineError::ProviderMetadata(format!("discovery {discovery}: {e}")))?
                    .error_for_status()
                    .map_err(|e| EngineError::ProviderMetadata(format!("discovery {discovery}: {e}")))?
                    .json()
                    .await
                    .map_err(|e| EngineError::ProviderMetadata(format!("discovery {discovery}: {e}")))?;
                (doc.issuer, doc.jwks_uri)
            }
            (None, Some(issuer), Some(jwks_url)) => (issuer.clone(), jwks_url.clone()),
            _ => {
                return Err(EngineError::Validation(format!(
                    "provider `{}` lacks discovery_url or issuer + jwks_url",
                    settings.name
                )));
            }
        };
        Ok(Self {
            name: settings.name.clone(),
            issuer,
            audience: settings.audience.clone(),
            jwks: JwksCache::new(jwks_url, client.clone()),
        })
    }
}

/// Claims the gate reads; everything else rides along in `extra`.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    iss: String,
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

/// Multi-provider OIDC gate in front of panel and render routes.
pub struct IdentityGate {
    panel: Option<OidcProvider>,
    render: Vec<OidcProvider>,
    render_authenticator: Option<Arc<dyn RenderAuthenticator>>,
}

impl IdentityGate {
    pub async fn from_settings(
        settings: &AuthSettings,
        render_authenticator: Option<Arc<dyn RenderAuthenticator>>,
        client: &reqwest::Client,
    ) -> Result<Self> {
        let panel = match &settings.panel {
            Some(p) => Some(OidcProvider::from_settings(p, client).await?),
            None => None,
        };
        let mut render = Vec::with_capacity(settings.render_providers.len());
        for p in &settings.render_providers {
            render.push(OidcProvider::from_settings(p, client).await?);
        }
        let gate = Self {
            panel,
            render,
            render_authenticator,
        };
        if gate.is_dummy_mode() {
            warn!(
                "no panel OIDC provider configured: dummy mode active, every request runs as a \
                 synthetic SUPERADMIN. Do not expose this server."
            );
        }
        Ok(gate)
    }

    /// True when no panel provider is configured and a synthetic
    /// SUPERADMIN identity is injected on every request.
    pub fn is_dummy_mode(&self) -> bool {
        self.panel.is_none()
    }

    /// Warms every JWKS cache; called at startup and periodically from
    /// the background refresh task.
    pub async fn refresh_keys(&self) {
        for provider in self.panel.iter().chain(self.render.iter()) {
            if let Err(error) = provider.jwks.refresh().await {
                warn!(provider = %provider.name, %error, "jwks refresh failed");
            }
        }
    }

    /// Authenticates one request. `authorization` is the raw
    /// `Authorization` header value, if present.
    pub async fn authenticate(
        &self,
        route: RouteClass,
        authorization: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Result<Identity> {
        if route == RouteClass::Render {
            if let Some(authenticator) = &self.render_authenticator {
                return authenticator.authenticate(authorization, headers).await;
            }
        }
        if self.is_dummy_mode() {
            return Ok(Identity::dummy());
        }

        let token = bearer_token(authorization)?;
        // First pass reads the issuer without trusting the signature,
        // only to pick the provider whose keys verify the second pass.
        let unverified = parse_unverified(token)?;
        let provider = self.select_provider(route, &unverified.iss)?;

        let header = decode_header(token)
            .map_err(|e| EngineError::InvalidToken(format!("bad token header: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| EngineError::InvalidToken("token has no key id".to_string()))?;
        let key = provider.jwks.key_for(&kid).await?;

        let claims = verify(token, &key, header.alg, provider)?;
        Ok(Identity {
            user_id: None,
            subject: claims.sub,
            email: claims.email.unwrap_or_default(),
            provider: provider.name.clone(),
            extra: claims.extra,
        })
    }

    fn select_provider(&self, route: RouteClass, issuer: &str) -> Result<&OidcProvider> {
        let panel = self.panel.as_ref().filter(|p| p.issuer == issuer);
        match route {
            RouteClass::Panel => panel.ok_or_else(|| {
                EngineError::InvalidToken(format!("issuer `{issuer}` not allowed on panel routes"))
            }),
            RouteClass::Render => panel
                .or_else(|| self.render.iter().find(|p| p.issuer == issuer))
                .ok_or_else(|| {
                    EngineError::InvalidToken(format!(
                        "issuer `{issuer}` not allowed on render routes"
                    ))
                }),
        }
    }
}

fn bearer_token(authorization: Option<&str>) -> Result<&str> {
    let value = authorization
        .ok_or_else(|| EngineError::Unauthorized("missing Authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| EngineError::Unauthorized("expected a bearer token".to_string()))
}

/// Parses claims without verifying the signature. Used only to select
/// the provider; nothing from this pass is trusted.
fn parse_unverified(token: &str) -> Result<TokenClaims> {
    let header = decode_header(token)
        .map_err(|e| EngineError::InvalidToken(format!("bad token header: {e}")))?;
    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| EngineError::InvalidToken(format!("unreadable claims: {e}")))
}

fn verify(
    token: &str,
    key: &DecodingKey,
    alg: Algorithm,
    provider: &OidcProvider,
) -> Result<TokenClaims> {
    let mut validation = Validation::new(alg);
    validation.set_issuer(&[&provider.issuer]);
    match &provider.audience {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }
    decode::<TokenClaims>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => EngineError::TokenExpired,
            _ => EngineError::InvalidToken(e.to_string()),
        })
}
