//! Cached OpenID Connect discovery documents for upstream identity providers.
//!
//! Documents are kept for the configured TTL. When a refresh fails, the last good copy is
//! served instead so an upstream outage does not block sign-in.

use crate::errors::GateError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WELL_KNOWN_PATH: &str = "/.well-known/openid-configuration";
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

#[derive(Debug, Clone)]
struct CachedDocument {
    metadata: ProviderMetadata,
    fetched_at: Instant,
}

#[derive(Clone)]
pub struct DiscoveryCache {
    http: reqwest::Client,
    ttl: Duration,
    entries: Arc<DashMap<String, CachedDocument>>,
}

pub fn discovery_url(issuer: &str) -> String {
    format!("{}{WELL_KNOWN_PATH}", issuer.trim_end_matches('/'))
}

impl DiscoveryCache {
    pub fn new(ttl_secs: u64) -> Result<Self, GateError> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            ttl: Duration::from_secs(ttl_secs),
            entries: Arc::new(DashMap::new()),
        })
    }

    /// Fresh cached document, else a fetch, else the stale cached document.
    pub async fn get(&self, issuer: &str) -> Result<ProviderMetadata, GateError> {
        let key = issuer.trim_end_matches('/').to_string();
        let cached = self.entries.get(&key).map(|e| e.clone());
        if let Some(doc) = &cached {
            if doc.fetched_at.elapsed() < self.ttl {
                return Ok(doc.metadata.clone());
            }
        }

        match self.fetch(&key).await {
            Ok(metadata) => {
                self.entries.insert(
                    key,
                    CachedDocument {
                        metadata: metadata.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(metadata)
            }
            Err(e) => match cached {
                Some(stale) => {
                    tracing::warn!(%issuer, error = %e, "Discovery refresh failed, serving stale document");
                    Ok(stale.metadata)
                }
                None => Err(e),
            },
        }
    }

    async fn fetch(&self, issuer: &str) -> Result<ProviderMetadata, GateError> {
        let url = discovery_url(issuer);
        tracing::debug!(%url, "Fetching discovery document");
        let metadata: ProviderMetadata = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if metadata.issuer.trim_end_matches('/') != issuer {
            return Err(GateError::Http(format!(
                "discovery document for {issuer} names issuer {}",
                metadata.issuer
            )));
        }
        Ok(metadata)
    }

    #[cfg(test)]
    fn seed(&self, issuer: &str, metadata: ProviderMetadata, age: Duration) {
        let fetched_at = Instant::now()
            .checked_sub(age)
            .unwrap_or_else(Instant::now);
        self.entries.insert(
            issuer.trim_end_matches('/').to_string(),
            CachedDocument {
                metadata,
                fetched_at,
            },
        );
    }
}
