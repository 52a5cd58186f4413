//! Telemetry transmitter — drives the credential resolver and transport
//! across a bounded retry loop, producing a single outcome per cycle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collector::DeviceSnapshot;
use crate::config::EffectiveSettings;

use super::auth::{CredentialResolver, TokenProvider};
use super::error::TelemetryError;
use super::transport::{classify_status, fetch_with_timeout, Disposition};

pub const MAX_API_RETRY_ATTEMPTS: u32 = 3;
pub const INITIAL_BACKOFF_MS: u64 = 1_000;

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRACE_ID_HEADER: &str = "x-trace-id";

const CLIENT_IDENTITY: &str = concat!("iiq-companion/", env!("CARGO_PKG_VERSION"));

/// Result of one full transmit cycle (all attempts included).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransmissionOutcome {
    pub status: u16,
    pub ok: bool,
    pub body: Option<Value>,
    /// Request id of the final attempt (server echo preferred).
    pub request_id: String,
    pub trace_id: Option<String>,
    pub attempts: u32,
    /// Server-recommended minutes until the next check-in.
    pub recommended_delay_minutes: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

pub struct Transmitter<P: TokenProvider> {
    http: reqwest::Client,
    resolver: CredentialResolver<P>,
}

impl<P: TokenProvider> Transmitter<P> {
    pub fn new(resolver: CredentialResolver<P>) -> Result<Self, TelemetryError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, resolver })
    }

    /// Clear cached credentials (configuration-refresh path).
    pub async fn invalidate_credentials(&self, settings: &EffectiveSettings) {
        self.resolver.invalidate(settings).await;
    }

    #[cfg(test)]
    pub fn resolver(&self) -> &CredentialResolver<P> {
        &self.resolver
    }

    /// Transmit one snapshot. Up to [`MAX_API_RETRY_ATTEMPTS`] attempts with
    /// exponential backoff (initial 1 s, doubled, capped at 30 s). A 401 or
    /// a network-level failure invalidates credentials and forces a fresh
    /// resolution before the next attempt. The last retryable error becomes
    /// the terminal failure once attempts are exhausted.
    pub async fn send_telemetry(
        &self,
        settings: &EffectiveSettings,
        snapshot: &DeviceSnapshot,
    ) -> Result<TransmissionOutcome, TelemetryError> {
        let url = settings
            .telemetry_url()
            .ok_or(TelemetryError::ConfigurationMissing)?;

        let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
        let backoff_cap = Duration::from_millis(super::transport::BACKOFF_CAP_MS);
        let mut force_refresh = false;

        for attempt in 1..=MAX_API_RETRY_ATTEMPTS {
            let request_id = Uuid::new_v4().to_string();
            let auth_headers = self
                .resolver
                .resolve_auth_headers(settings, force_refresh)
                .await?;
            force_refresh = false;

            let mut headers = base_headers(&request_id)?;
            headers.extend(auth_headers);

            let request = self
                .http
                .post(&url)
                .headers(headers)
                .json(snapshot)
                .build()?;

            debug!(attempt, %url, request_id = %request_id, "sending telemetry");

            match fetch_with_timeout(&self.http, request, settings.request_timeout_ms).await {
                Ok(response) => {
                    let status = response.status();
                    match classify_status(status, response.headers()) {
                        Disposition::Terminal => {
                            return build_outcome(response, request_id, attempt).await;
                        }
                        Disposition::AuthRejected => {
                            warn!(attempt, "server rejected credentials, invalidating");
                            self.resolver.invalidate(settings).await;
                            force_refresh = true;
                            if attempt == MAX_API_RETRY_ATTEMPTS {
                                return Err(TelemetryError::AuthenticationRejected);
                            }
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(backoff_cap);
                        }
                        Disposition::Retryable { retry_after } => {
                            warn!(attempt, status = status.as_u16(), "retryable server error");
                            if attempt == MAX_API_RETRY_ATTEMPTS {
                                return Err(TelemetryError::RetryableServer {
                                    status: status.as_u16(),
                                });
                            }
                            // Server hint replaces the exponential value.
                            tokio::time::sleep(retry_after.unwrap_or(backoff)).await;
                            backoff = (backoff * 2).min(backoff_cap);
                        }
                    }
                }
                Err(e) if e.is_retryable() && attempt < MAX_API_RETRY_ATTEMPTS => {
                    warn!(attempt, error = %e, "transport failure, invalidating credentials");
                    self.resolver.invalidate(settings).await;
                    force_refresh = true;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(backoff_cap);
                }
                Err(e) => return Err(e),
            }
        }

        Err(TelemetryError::InvalidResponse(
            "retry loop exhausted without an outcome".to_string(),
        ))
    }
}

fn base_headers(request_id: &str) -> Result<HeaderMap, TelemetryError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static(CLIENT_ID_HEADER),
        HeaderValue::from_static(CLIENT_IDENTITY),
    );
    headers.insert(
        HeaderName::from_static(REQUEST_ID_HEADER),
        HeaderValue::from_str(request_id)
            .map_err(|_| TelemetryError::InvalidResponse("request id not header-safe".into()))?,
    );
    Ok(headers)
}

async fn build_outcome(
    response: reqwest::Response,
    request_id: String,
    attempts: u32,
) -> Result<TransmissionOutcome, TelemetryError> {
    let status = response.status();
    let trace_id = header_string(response.headers(), TRACE_ID_HEADER);
    let echoed_request_id =
        header_string(response.headers(), REQUEST_ID_HEADER).unwrap_or(request_id);

    let text = response
        .text()
        .await
        .map_err(|e| TelemetryError::InvalidResponse(format!("reading body: {}", e)))?;
    let body: Option<Value> = if text.trim().is_empty() {
        None
    } else {
        serde_json::from_str(&text).ok()
    };

    Ok(TransmissionOutcome {
        status: status.as_u16(),
        ok: status.is_success(),
        recommended_delay_minutes: parse_recommended_delay(body.as_ref()),
        body,
        request_id: echoed_request_id,
        trace_id,
        attempts,
        timestamp: Utc::now(),
    })
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Pull `nextRecommendedCheckMinutes` out of the response body: must be a
/// finite positive number; anything else is ignored.
fn parse_recommended_delay(body: Option<&Value>) -> Option<u64> {
    body?
        .get("nextRecommendedCheckMinutes")?
        .as_f64()
        .filter(|m| m.is_finite() && *m > 0.0)
        .map(|m| m.round() as u64)
}
