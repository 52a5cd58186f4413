//! Layered settings resolution for the telemetry pipeline.
//!
//! Settings come from three sources, resolved with a fixed precedence:
//!
//!   managed policy file  >  saved user settings (+ env overrides)  >  defaults
//!
//! The managed layer is the enterprise-administrator-controlled file
//! (read-only from the agent's perspective). The saved layer is the user's
//! own settings file, with `IIQ_`-prefixed environment variables merged on
//! top. Resolution happens once per transmission attempt and the resulting
//! [`EffectiveSettings`] is immutable for the duration of that attempt.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TELEMETRY_ENDPOINT: &str = "/api/v1.0/devices/telemetry";
pub const DEFAULT_SYNC_INTERVAL_MINUTES: u64 = 60;
pub const MIN_SYNC_INTERVAL_MINUTES: u64 = 5;
pub const MAX_SYNC_INTERVAL_MINUTES: u64 = 720;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_TOKEN_LIFETIME_MINUTES: u64 = 60;

/// How the agent authenticates telemetry requests to the tenant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// Fixed `x-api-key` header. Stateless, nothing cached.
    #[default]
    ApiKey,
    /// A statically configured bearer token, cached with an expiry derived
    /// from the configured token lifetime.
    StaticBearer,
    /// Short-lived bearer token issued by the tenant identity provider,
    /// cached until its safety-adjusted expiry.
    DynamicToken,
}

/// One settings layer as read from disk. Every field optional — absence
/// means "this layer has no opinion" and resolution falls through to the
/// next layer.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsLayer {
    pub tenant_url: Option<String>,
    pub telemetry_endpoint: Option<String>,
    pub sync_interval_minutes: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub auth_method: Option<AuthMethod>,
    pub api_key: Option<String>,
    pub bearer_token: Option<String>,
    pub oauth_client_id: Option<String>,
    pub token_lifetime_minutes: Option<u64>,
    pub scopes: Option<Vec<String>>,
}

/// Fully resolved settings for one transmission attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveSettings {
    /// Tenant base URL. `None` means no layer supplied one — the
    /// transmitter fails with `ConfigurationMissing` before any request.
    pub tenant_url: Option<String>,
    pub telemetry_endpoint: String,
    pub sync_interval_minutes: u64,
    pub request_timeout_ms: u64,
    pub auth_method: AuthMethod,
    pub api_key: Option<String>,
    pub bearer_token: Option<String>,
    pub oauth_client_id: Option<String>,
    pub token_lifetime_minutes: u64,
    pub scopes: Vec<String>,
}

impl Default for EffectiveSettings {
    fn default() -> Self {
        Self {
            tenant_url: None,
            telemetry_endpoint: DEFAULT_TELEMETRY_ENDPOINT.to_string(),
            sync_interval_minutes: DEFAULT_SYNC_INTERVAL_MINUTES,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            auth_method: AuthMethod::default(),
            api_key: None,
            bearer_token: None,
            oauth_client_id: None,
            token_lifetime_minutes: DEFAULT_TOKEN_LIFETIME_MINUTES,
            scopes: Vec::new(),
        }
    }
}

impl EffectiveSettings {
    /// Resolve the final settings from the saved and managed layers.
    /// Managed wins over saved; defaults fill whatever neither supplies.
    pub fn resolve(saved: SettingsLayer, managed: SettingsLayer) -> Self {
        let defaults = Self::default();

        let tenant_url = managed
            .tenant_url
            .or(saved.tenant_url)
            .and_then(|u| normalize_tenant_url(&u));

        let sync_interval_minutes = managed
            .sync_interval_minutes
            .or(saved.sync_interval_minutes)
            .map(clamp_sync_interval)
            .unwrap_or(defaults.sync_interval_minutes);

        let request_timeout_ms = managed
            .request_timeout_ms
            .or(saved.request_timeout_ms)
            .filter(|&ms| ms > 0)
            .unwrap_or(defaults.request_timeout_ms);

        let token_lifetime_minutes = managed
            .token_lifetime_minutes
            .or(saved.token_lifetime_minutes)
            .filter(|&m| m > 0)
            .unwrap_or(defaults.token_lifetime_minutes);

        Self {
            tenant_url,
            telemetry_endpoint: managed
                .telemetry_endpoint
                .or(saved.telemetry_endpoint)
                .filter(|e| !e.trim().is_empty())
                .unwrap_or(defaults.telemetry_endpoint),
            sync_interval_minutes,
            request_timeout_ms,
            auth_method: managed
                .auth_method
                .or(saved.auth_method)
                .unwrap_or(defaults.auth_method),
            api_key: managed.api_key.or(saved.api_key).filter(|k| !k.is_empty()),
            bearer_token: managed
                .bearer_token
                .or(saved.bearer_token)
                .filter(|t| !t.is_empty()),
            oauth_client_id: managed
                .oauth_client_id
                .or(saved.oauth_client_id)
                .filter(|c| !c.is_empty()),
            token_lifetime_minutes,
            scopes: managed.scopes.or(saved.scopes).unwrap_or_default(),
        }
    }

    /// Full telemetry endpoint URL, or `None` when no base URL resolved.
    pub fn telemetry_url(&self) -> Option<String> {
        self.tenant_url.as_ref().map(|base| {
            format!(
                "{}{}",
                base.trim_end_matches('/'),
                self.telemetry_endpoint
            )
        })
    }
}

/// Force https and strip any trailing slash. Returns `None` for blank input.
fn normalize_tenant_url(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let with_scheme = if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("https://{}", rest)
    } else if trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    Some(with_scheme.trim_end_matches('/').to_string())
}

fn clamp_sync_interval(minutes: u64) -> u64 {
    if minutes == 0 {
        return DEFAULT_SYNC_INTERVAL_MINUTES;
    }
    minutes.clamp(MIN_SYNC_INTERVAL_MINUTES, MAX_SYNC_INTERVAL_MINUTES)
}

// ── File layout ────────────────────────────────────────────

/// Locations of the two settings layers on disk.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// User-saved settings (writable by the settings UI, read-only here).
    pub saved: PathBuf,
    /// Managed policy file (administrator-controlled, read-only).
    pub managed: PathBuf,
}

impl ConfigPaths {
    pub fn default_paths() -> Result<Self> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(Self {
            saved: config_dir.join("iiq-companion").join("settings.toml"),
            managed: PathBuf::from("/etc/iiq-companion/policy.toml"),
        })
    }
}

/// Read one layer from a TOML file. A missing file yields an empty layer.
/// Environment variables prefixed `IIQ_` override file values in the saved
/// layer only (the managed layer is policy and never overridden locally).
fn load_layer(path: &Path, with_env: bool) -> Result<SettingsLayer> {
    let mut figment = Figment::new();
    if path.exists() {
        figment = figment.merge(Toml::file(path));
    }
    if with_env {
        figment = figment.merge(Env::prefixed("IIQ_"));
    }
    figment
        .extract()
        .with_context(|| format!("parsing settings layer {}", path.display()))
}

/// Load both layers and resolve. Called once per transmission attempt so
/// policy changes take effect without restarting the agent.
pub fn load_effective(paths: &ConfigPaths) -> Result<EffectiveSettings> {
    let saved = load_layer(&paths.saved, true)?;
    let managed = load_layer(&paths.managed, false)?;
    Ok(EffectiveSettings::resolve(saved, managed))
}

// ── Daemon config ──────────────────────────────────────────

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:9177";

/// Local daemon options, read from the `[daemon]` table of the saved
/// settings file. CLI flags override these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub http_addr: String,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            log_level: "info".to_string(),
        }
    }
}

pub fn load_daemon_config(saved_path: &Path) -> Result<DaemonConfig> {
    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct Wrapper {
        daemon: DaemonConfig,
    }

    if !saved_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let wrapper: Wrapper = Figment::from(Toml::file(saved_path))
        .extract()
        .with_context(|| format!("parsing {}", saved_path.display()))?;
    Ok(wrapper.daemon)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(tenant: Option<&str>, interval: Option<u64>) -> SettingsLayer {
        SettingsLayer {
            tenant_url: tenant.map(String::from),
            sync_interval_minutes: interval,
            ..SettingsLayer::default()
        }
    }

    #[test]
    fn managed_layer_wins_over_saved() {
        let saved = layer(Some("https://user.example.com"), Some(30));
        let managed = layer(Some("https://policy.example.com"), None);
        let effective = EffectiveSettings::resolve(saved, managed);

        assert_eq!(
            effective.tenant_url.as_deref(),
            Some("https://policy.example.com")
        );
        // Managed had no interval, so the saved value survives.
        assert_eq!(effective.sync_interval_minutes, 30);
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let effective = EffectiveSettings::resolve(SettingsLayer::default(), SettingsLayer::default());
        assert_eq!(effective.tenant_url, None);
        assert_eq!(effective.telemetry_endpoint, DEFAULT_TELEMETRY_ENDPOINT);
        assert_eq!(effective.sync_interval_minutes, DEFAULT_SYNC_INTERVAL_MINUTES);
        assert_eq!(effective.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert_eq!(effective.auth_method, AuthMethod::ApiKey);
    }

    #[test]
    fn sync_interval_is_clamped() {
        let effective =
            EffectiveSettings::resolve(layer(None, Some(2)), SettingsLayer::default());
        assert_eq!(effective.sync_interval_minutes, MIN_SYNC_INTERVAL_MINUTES);

        let effective =
            EffectiveSettings::resolve(layer(None, Some(10_000)), SettingsLayer::default());
        assert_eq!(effective.sync_interval_minutes, MAX_SYNC_INTERVAL_MINUTES);

        let effective =
            EffectiveSettings::resolve(layer(None, Some(0)), SettingsLayer::default());
        assert_eq!(effective.sync_interval_minutes, DEFAULT_SYNC_INTERVAL_MINUTES);
    }

    #[test]
    fn tenant_url_is_normalized() {
        assert_eq!(
            normalize_tenant_url("district.incidentiq.com/").as_deref(),
            Some("https://district.incidentiq.com")
        );
        assert_eq!(
            normalize_tenant_url("http://district.incidentiq.com").as_deref(),
            Some("https://district.incidentiq.com")
        );
        assert_eq!(normalize_tenant_url("   "), None);
    }

    #[test]
    fn telemetry_url_joins_base_and_endpoint() {
        let effective = EffectiveSettings {
            tenant_url: Some("https://t.example.com/api/v1/".to_string()),
            ..EffectiveSettings::default()
        };
        assert_eq!(
            effective.telemetry_url().as_deref(),
            Some("https://t.example.com/api/v1/api/v1.0/devices/telemetry")
        );
        assert_eq!(EffectiveSettings::default().telemetry_url(), None);
    }

    #[test]
    fn empty_credentials_are_dropped() {
        let saved = SettingsLayer {
            api_key: Some(String::new()),
            oauth_client_id: Some("client-1".to_string()),
            ..SettingsLayer::default()
        };
        let effective = EffectiveSettings::resolve(saved, SettingsLayer::default());
        assert_eq!(effective.api_key, None);
        assert_eq!(effective.oauth_client_id.as_deref(), Some("client-1"));
    }
}
