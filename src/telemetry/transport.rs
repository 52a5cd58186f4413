//! One HTTP request with an explicit timeout, plus response classification.
//!
//! The timeout is enforced by dropping the in-flight request future, which
//! cancels the underlying connection — a timeout is reported as
//! [`TelemetryError::Timeout`], distinct from generic network failure.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Request, Response, StatusCode};

use super::error::TelemetryError;

/// Upper bound for any single retry delay.
pub const BACKOFF_CAP_MS: u64 = 30_000;

/// What the retry loop should do with a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// 401 — the presented credential is dead. Invalidate and re-resolve
    /// before the next attempt.
    AuthRejected,
    /// 408/429/5xx — try again after backoff. When the server sent a
    /// usable `Retry-After`, that delay (capped) replaces the exponential
    /// value.
    Retryable { retry_after: Option<Duration> },
    /// Anything else, success or not: the attempt loop ends here.
    Terminal,
}

/// Classify a response status together with its `Retry-After` header.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> Disposition {
    match status.as_u16() {
        401 => Disposition::AuthRejected,
        408 | 429 => Disposition::Retryable {
            retry_after: retry_after_delay(headers),
        },
        s if s >= 500 => Disposition::Retryable {
            retry_after: retry_after_delay(headers),
        },
        _ => Disposition::Terminal,
    }
}

/// Parse `Retry-After` as positive integer seconds, capped at the backoff
/// ceiling. Malformed or non-positive values are ignored.
fn retry_after_delay(headers: &HeaderMap) -> Option<Duration> {
    let secs: u64 = headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    if secs == 0 {
        return None;
    }
    Some(Duration::from_millis(secs.saturating_mul(1000).min(BACKOFF_CAP_MS)))
}

/// Execute one request, aborting it when `timeout_ms` elapses first.
pub async fn fetch_with_timeout(
    client: &Client,
    request: Request,
    timeout_ms: u64,
) -> Result<Response, TelemetryError> {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), client.execute(request)).await
    {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(TelemetryError::Network(e)),
        Err(_) => Err(TelemetryError::Timeout { ms: timeout_ms }),
    }
}
