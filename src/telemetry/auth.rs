//! Credential resolution for telemetry requests.
//!
//! Three strategies, selected by the resolved settings:
//!
//! - `api-key`: a fixed `x-api-key` header. Stateless.
//! - `static-bearer`: a configured bearer token, cached with an expiry
//!   computed from the configured lifetime minus the safety window.
//! - `dynamic-token`: a short-lived token issued by the tenant identity
//!   provider, cached until its safety-adjusted expiry and evicted from the
//!   provider on invalidation so a later acquisition cannot silently reuse
//!   a stale value.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{AuthMethod, EffectiveSettings};

use super::error::TelemetryError;

/// Margin subtracted from a token's nominal expiry so a token never expires
/// mid-flight.
pub const TOKEN_SAFETY_WINDOW_MINUTES: i64 = 5;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    DynamicallyIssued,
    StaticallyConfigured,
}

/// Process-lifetime cached token. `expires_at` already has the safety
/// window subtracted.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub source: TokenSource,
}

impl CachedToken {
    pub fn new(
        token: String,
        lifetime_minutes: i64,
        source: TokenSource,
        now: DateTime<Utc>,
    ) -> Self {
        let usable = (lifetime_minutes - TOKEN_SAFETY_WINDOW_MINUTES).max(0);
        Self {
            token,
            expires_at: now + Duration::minutes(usable),
            source,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A token freshly issued by the identity provider.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    /// Provider-reported lifetime; the configured lifetime applies when the
    /// provider doesn't say.
    pub expires_in_secs: Option<u64>,
}

/// Host identity provider: issues short-lived tokens for the configured
/// scopes and can forget a previously issued one.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Request a token non-interactively. `Ok(None)` means the provider
    /// declined (user not signed in, consent withheld).
    async fn issue_token(
        &self,
        settings: &EffectiveSettings,
    ) -> Result<Option<IssuedToken>, TelemetryError>;

    /// Evict a token from the provider's own cache.
    async fn forget_token(
        &self,
        settings: &EffectiveSettings,
        token: &str,
    ) -> Result<(), TelemetryError>;
}

/// Resolves the authentication header set for one attempt, owning the
/// process-lifetime token cache.
pub struct CredentialResolver<P: TokenProvider> {
    provider: P,
    cache: RwLock<Option<CachedToken>>,
}

impl<P: TokenProvider> CredentialResolver<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            cache: RwLock::new(None),
        }
    }

    /// Produce the auth headers for the current settings. `force_refresh`
    /// bypasses the dynamic-token cache, evicting the old token first.
    pub async fn resolve_auth_headers(
        &self,
        settings: &EffectiveSettings,
        force_refresh: bool,
    ) -> Result<HeaderMap, TelemetryError> {
        match settings.auth_method {
            AuthMethod::ApiKey => {
                let key = settings.api_key.as_deref().ok_or_else(|| {
                    TelemetryError::CredentialUnavailable("no API key configured".to_string())
                })?;
                let mut headers = HeaderMap::new();
                headers.insert(
                    HeaderName::from_static(API_KEY_HEADER),
                    header_value(key)?,
                );
                Ok(headers)
            }
            AuthMethod::StaticBearer => {
                let token = self.static_bearer(settings).await?;
                bearer_headers(&token)
            }
            AuthMethod::DynamicToken => {
                let token = self.dynamic_token(settings, force_refresh).await?;
                bearer_headers(&token)
            }
        }
    }

    async fn static_bearer(&self, settings: &EffectiveSettings) -> Result<String, TelemetryError> {
        let now = Utc::now();
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.source == TokenSource::StaticallyConfigured && !cached.is_expired(now) {
                return Ok(cached.token.clone());
            }
        }

        let token = settings.bearer_token.clone().ok_or_else(|| {
            TelemetryError::CredentialUnavailable("no bearer token configured".to_string())
        })?;
        let cached = CachedToken::new(
            token.clone(),
            settings.token_lifetime_minutes as i64,
            TokenSource::StaticallyConfigured,
            now,
        );
        debug!(expires_at = %cached.expires_at, "cached static bearer token");
        *self.cache.write().await = Some(cached);
        Ok(token)
    }

    async fn dynamic_token(
        &self,
        settings: &EffectiveSettings,
        force_refresh: bool,
    ) -> Result<String, TelemetryError> {
        let now = Utc::now();

        if !force_refresh {
            if let Some(cached) = self.cache.read().await.as_ref() {
                if cached.source == TokenSource::DynamicallyIssued && !cached.is_expired(now) {
                    return Ok(cached.token.clone());
                }
            }
        }

        // When forcing, evict the old token from the provider cache first.
        // Best-effort: a failed eviction is logged, not fatal.
        if force_refresh {
            let stale = self.cache.write().await.take();
            if let Some(stale) = stale.filter(|t| t.source == TokenSource::DynamicallyIssued) {
                if let Err(e) = self.provider.forget_token(settings, &stale.token).await {
                    warn!(error = %e, "failed to evict stale token from provider cache");
                }
            }
        }

        let issued = self
            .provider
            .issue_token(settings)
            .await?
            .ok_or_else(|| {
                TelemetryError::CredentialUnavailable(
                    "identity provider yielded no token".to_string(),
                )
            })?;

        let lifetime_minutes = issued
            .expires_in_secs
            .map(|secs| (secs / 60) as i64)
            .unwrap_or(settings.token_lifetime_minutes as i64);
        let cached = CachedToken::new(
            issued.token.clone(),
            lifetime_minutes,
            TokenSource::DynamicallyIssued,
            now,
        );
        info!(expires_at = %cached.expires_at, "acquired fresh token from identity provider");
        *self.cache.write().await = Some(cached);
        Ok(issued.token)
    }

    /// Clear the cached token. A dynamically sourced token is additionally
    /// evicted from the provider cache.
    pub async fn invalidate(&self, settings: &EffectiveSettings) {
        let taken = self.cache.write().await.take();
        if let Some(token) = taken.filter(|t| t.source == TokenSource::DynamicallyIssued) {
            if let Err(e) = self.provider.forget_token(settings, &token.token).await {
                warn!(error = %e, "failed to evict invalidated token from provider cache");
            }
        }
    }

    #[cfg(test)]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    #[cfg(test)]
    pub async fn seed_cache(&self, token: CachedToken) {
        *self.cache.write().await = Some(token);
    }

    #[cfg(test)]
    pub async fn cached(&self) -> Option<CachedToken> {
        self.cache.read().await.clone()
    }
}

fn bearer_headers(token: &str) -> Result<HeaderMap, TelemetryError> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, TelemetryError> {
    HeaderValue::from_str(value).map_err(|_| {
        TelemetryError::CredentialUnavailable(
            "credential contains characters not valid in a header".to_string(),
        )
    })
}

// ── HTTP token provider ────────────────────────────────────

const TOKEN_ISSUE_PATH: &str = "/services/oauth/token";
const TOKEN_REVOKE_PATH: &str = "/services/oauth/revoke";

/// Identity provider backed by the tenant's OAuth token service
/// (client-credentials grant, non-interactive).
pub struct HttpTokenProvider {
    http: reqwest::Client,
}

impl HttpTokenProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn issue_token(
        &self,
        settings: &EffectiveSettings,
    ) -> Result<Option<IssuedToken>, TelemetryError> {
        let base = settings
            .tenant_url
            .as_deref()
            .ok_or(TelemetryError::ConfigurationMissing)?;
        let client_id = settings.oauth_client_id.as_deref().ok_or_else(|| {
            TelemetryError::CredentialUnavailable("no OAuth client id configured".to_string())
        })?;

        let response = self
            .http
            .post(format!("{}{}", base.trim_end_matches('/'), TOKEN_ISSUE_PATH))
            .json(&serde_json::json!({
                "grant_type": "client_credentials",
                "client_id": client_id,
                "scope": settings.scopes.join(" "),
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "identity provider declined token request");
            return Ok(None);
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TelemetryError::InvalidResponse(format!("token response: {}", e)))?;
        Ok(Some(IssuedToken {
            token: token.access_token,
            expires_in_secs: token.expires_in,
        }))
    }

    async fn forget_token(
        &self,
        settings: &EffectiveSettings,
        token: &str,
    ) -> Result<(), TelemetryError> {
        let base = settings
            .tenant_url
            .as_deref()
            .ok_or(TelemetryError::ConfigurationMissing)?;
        self.http
            .post(format!("{}{}", base.trim_end_matches('/'), TOKEN_REVOKE_PATH))
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        issued: AtomicUsize,
        forgotten: AtomicUsize,
        decline: bool,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                issued: AtomicUsize::new(0),
                forgotten: AtomicUsize::new(0),
                decline: false,
            }
        }

        fn declining() -> Self {
            Self {
                decline: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn issue_token(
            &self,
            _settings: &EffectiveSettings,
        ) -> Result<Option<IssuedToken>, TelemetryError> {
            if self.decline {
                return Ok(None);
            }
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Some(IssuedToken {
                token: format!("tok-{}", n),
                expires_in_secs: None,
            }))
        }

        async fn forget_token(
            &self,
            _settings: &EffectiveSettings,
            _token: &str,
        ) -> Result<(), TelemetryError> {
            self.forgotten.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dynamic_settings() -> EffectiveSettings {
        EffectiveSettings {
            auth_method: AuthMethod::DynamicToken,
            oauth_client_id: Some("client-1".to_string()),
            token_lifetime_minutes: 60,
            ..EffectiveSettings::default()
        }
    }

    fn bearer_of(headers: &HeaderMap) -> String {
        headers[AUTHORIZATION].to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn dynamic_token_is_cached_and_reused() {
        let resolver = CredentialResolver::new(CountingProvider::new());
        let settings = dynamic_settings();

        let first = resolver.resolve_auth_headers(&settings, false).await.unwrap();
        let second = resolver.resolve_auth_headers(&settings, false).await.unwrap();
        assert_eq!(bearer_of(&first), "Bearer tok-1");
        assert_eq!(bearer_of(&second), "Bearer tok-1");
        assert_eq!(resolver.provider.issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_token_triggers_fresh_issue() {
        let resolver = CredentialResolver::new(CountingProvider::new());
        let settings = dynamic_settings();

        // Seed a token whose safety-adjusted expiry has passed.
        resolver
            .seed_cache(CachedToken {
                token: "stale".to_string(),
                expires_at: Utc::now() - Duration::minutes(1),
                source: TokenSource::DynamicallyIssued,
            })
            .await;

        let headers = resolver.resolve_auth_headers(&settings, false).await.unwrap();
        assert_eq!(bearer_of(&headers), "Bearer tok-1");
    }

    #[tokio::test]
    async fn forced_refresh_evicts_then_reissues() {
        let resolver = CredentialResolver::new(CountingProvider::new());
        let settings = dynamic_settings();

        resolver.resolve_auth_headers(&settings, false).await.unwrap();
        let headers = resolver.resolve_auth_headers(&settings, true).await.unwrap();

        assert_eq!(bearer_of(&headers), "Bearer tok-2");
        assert_eq!(resolver.provider.forgotten.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn declining_provider_is_credential_unavailable() {
        let resolver = CredentialResolver::new(CountingProvider::declining());
        let err = resolver
            .resolve_auth_headers(&dynamic_settings(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::CredentialUnavailable(_)));
    }

    #[tokio::test]
    async fn invalidate_forgets_dynamic_tokens_only() {
        let resolver = CredentialResolver::new(CountingProvider::new());
        let settings = dynamic_settings();

        resolver.resolve_auth_headers(&settings, false).await.unwrap();
        resolver.invalidate(&settings).await;
        assert_eq!(resolver.provider.forgotten.load(Ordering::SeqCst), 1);
        assert!(resolver.cached().await.is_none());

        // A statically cached token is cleared without a provider call.
        resolver
            .seed_cache(CachedToken::new(
                "static".to_string(),
                60,
                TokenSource::StaticallyConfigured,
                Utc::now(),
            ))
            .await;
        resolver.invalidate(&settings).await;
        assert_eq!(resolver.provider.forgotten.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn api_key_strategy_is_stateless() {
        let resolver = CredentialResolver::new(CountingProvider::new());
        let settings = EffectiveSettings {
            auth_method: AuthMethod::ApiKey,
            api_key: Some("key-1".to_string()),
            ..EffectiveSettings::default()
        };

        let headers = resolver.resolve_auth_headers(&settings, false).await.unwrap();
        assert_eq!(headers[API_KEY_HEADER].to_str().unwrap(), "key-1");
        assert!(resolver.cached().await.is_none());
        assert_eq!(resolver.provider.issued.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn static_bearer_is_cached_until_expiry() {
        let resolver = CredentialResolver::new(CountingProvider::new());
        let settings = EffectiveSettings {
            auth_method: AuthMethod::StaticBearer,
            bearer_token: Some("bt-1".to_string()),
            token_lifetime_minutes: 60,
            ..EffectiveSettings::default()
        };

        resolver.resolve_auth_headers(&settings, false).await.unwrap();
        let cached = resolver.cached().await.unwrap();
        assert_eq!(cached.source, TokenSource::StaticallyConfigured);
        // 60 minutes minus the 5-minute safety window
        let usable = cached.expires_at - Utc::now();
        assert!(usable <= Duration::minutes(55));
        assert!(usable > Duration::minutes(54));
    }

    #[test]
    fn safety_window_math() {
        let now = Utc::now();
        let token = CachedToken::new(
            "t".to_string(),
            60,
            TokenSource::DynamicallyIssued,
            now,
        );
        // Usable at 54 minutes, expired at the 55-minute adjusted boundary.
        assert!(!token.is_expired(now + Duration::minutes(54)));
        assert!(token.is_expired(now + Duration::minutes(55)));
    }
}
