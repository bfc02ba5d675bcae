use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::JwkSet;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::{EngineError, Result};

/// Signature-key cache for one OIDC provider. Filled from the JWKS
/// endpoint at startup, refreshed in the background and re-fetched once
/// on an unknown key id (key rotation).
pub struct JwksCache {
    url: String,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
}

impl JwksCache {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Replaces the cached keys with the endpoint's current set.
    pub async fn refresh(&self) -> Result<()> {
        let set: JwkSet = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| EngineError::ProviderMetadata(format!("jwks fetch {}: {e}", self.url)))?
            .error_for_status()
            .map_err(|e| EngineError::ProviderMetadata(format!("jwks fetch {}: {e}", self.url)))?
            .json()
            .await
            .map_err(|e| EngineError::ProviderMetadata(format!("jwks body {}: {e}", self.url)))?;

        let mut fresh = HashMap::new();
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    fresh.insert(kid, key);
                }
                Err(error) => {
                    warn!(kid = %kid, %error, "skipping unusable jwk");
                }
            }
        }
        debug!(url = %self.url, keys = fresh.len(), "jwks refreshed");
        *self.keys.write() = fresh;
        Ok(())
    }

    /// Looks a key id up, re-fetching the set once on a miss.
    pub async fn key_for(&self, kid: &str) -> Result<DecodingKey> {
        if let Some(key) = self.keys.read().get(kid) {
            return Ok(key.clone());
        }
        self.refresh().await?;
        self.keys
            .read()
            .get(kid)
            .cloned()
            .ok_or_else(|| EngineError::InvalidToken(format!("unknown signing key `{kid}`")))
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7517 appendix A.1 RSA public key.
    const JWKS_BODY: &str = r#"{"keys":[{
        "kty":"RSA",
        "n":"0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
        "e":"AQAB",
        "alg":"RS256",
        "kid":"2011-04-29"
    }]}"#;

    fn serve_jwks(hits: std::sync::Arc<std::sync::atomic::AtomicUsize>) -> String {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        std::thread::spawn(move || {
            while let Ok(Some(request)) =
                server.recv_timeout(std::time::Duration::from_secs(3))
            {
                hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let response = tiny_http::Response::from_string(JWKS_BODY).with_header(
                    tiny_http::Header::from_bytes(b"Content-Type", b"application/json").unwrap(),
                );
                let _ = request.respond(response);
            }
        });
        format!("http://{addr}/jwks")
    }

    #[tokio::test]
    async fn refresh_populates_keys_by_kid() {
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let cache = JwksCache::new(serve_jwks(hits), reqwest::Client::new());
        cache.refresh().await.unwrap();
        assert_eq!(cache.key_count(), 1);
        cache.key_for("2011-04-29").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_kid_refreshes_once_then_fails() {
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let cache = JwksCache::new(
            serve_jwks(std::sync::Arc::clone(&hits)),
            reqwest::Client::new(),
        );
        let err = cache.key_for("rotated-away").await.err().unwrap();
        assert!(matches!(err, EngineError::InvalidToken(_)));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_metadata_error() {
        let cache = JwksCache::new("http://127.0.0.1:1/jwks", reqwest::Client::new());
        let err = cache.refresh().await.unwrap_err();
        assert!(matches!(err, EngineError::ProviderMetadata(_)));
    }
}
