//! Persisted sync status — atomic file I/O with SHA-256 integrity.
//!
//! The pipeline writes exactly one record per transmission attempt: the
//! response record on a terminal response, or an error record on a terminal
//! failure. Recording a terminal response clears any earlier error record,
//! so exactly one of the two is authoritative at any time. The `status` CLI command and
//! the local REST API read this file to answer "how is syncing going?".

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;

use crate::telemetry::error::TelemetryError;
use crate::telemetry::transmitter::TransmissionOutcome;

/// Sync attempts older than this (minutes) mark the device as degraded.
pub const STALE_THRESHOLD_MINUTES: i64 = 6 * 60;

/// Metadata captured from the most recent terminal response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransmissionRecord {
    pub status: u16,
    pub ok: bool,
    pub request_id: String,
    pub trace_id: Option<String>,
    pub attempts: u32,
    pub recommended_delay_minutes: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl From<&TransmissionOutcome> for TransmissionRecord {
    fn from(outcome: &TransmissionOutcome) -> Self {
        Self {
            status: outcome.status,
            ok: outcome.ok,
            request_id: outcome.request_id.clone(),
            trace_id: outcome.trace_id.clone(),
            attempts: outcome.attempts,
            recommended_delay_minutes: outcome.recommended_delay_minutes,
            timestamp: outcome.timestamp,
        }
    }
}

/// Serialized form of the most recent terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn from_error(error: &TelemetryError) -> Self {
        Self {
            message: error.to_string(),
            kind: error.kind().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// The full persisted state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncStatus {
    pub last_response: Option<TransmissionRecord>,
    pub last_error: Option<ErrorRecord>,
    /// ISO-8601 timestamp of the last successful check-in, echoed back to
    /// the tenant in the next snapshot.
    pub last_checkin_time: Option<String>,
}

/// SyncStatus wrapped with integrity metadata for storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredStatus {
    /// SHA-256 checksum of the serialized status: "sha256:<hex>"
    checksum: String,
    updated_at: DateTime<Utc>,
    status: SyncStatus,
}

impl StoredStatus {
    fn new(status: SyncStatus) -> Self {
        Self {
            checksum: checksum_of(&status),
            updated_at: Utc::now(),
            status,
        }
    }

    fn verify(&self) -> bool {
        self.checksum == checksum_of(&self.status)
    }
}

fn checksum_of(status: &SyncStatus) -> String {
    let serialized = serde_json::to_string(status).unwrap_or_default();
    let hash = Sha256::digest(serialized.as_bytes());
    format!("sha256:{:x}", hash)
}

pub struct StatusStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StatusStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::config_dir)
            .context("could not determine data directory")?;
        Ok(data_dir.join("iiq-companion").join("status.json"))
    }

    /// Read the persisted status. Missing file yields the empty default;
    /// a corrupt or tampered file is reported as an error.
    pub async fn load(&self) -> Result<SyncStatus> {
        if !self.path.exists() {
            return Ok(SyncStatus::default());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let stored: StoredStatus = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", self.path.display()))?;

        if !stored.verify() {
            warn!(path = %self.path.display(), "status file checksum mismatch");
            bail!("checksum verification failed for {}", self.path.display());
        }

        Ok(stored.status)
    }

    /// Like [`load`](Self::load) but degrades to the empty default instead
    /// of failing, so a corrupt status file never blocks a push.
    pub async fn load_or_default(&self) -> SyncStatus {
        match self.load().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "could not load sync status, starting empty");
                SyncStatus::default()
            }
        }
    }

    /// Record a terminal response. Any terminal response supersedes an
    /// earlier error record; a successful one additionally advances the
    /// last check-in timestamp.
    pub async fn record_response(&self, outcome: &TransmissionOutcome) -> Result<()> {
        let mut status = self.load_or_default().await;
        status.last_response = Some(TransmissionRecord::from(outcome));
        status.last_error = None;
        if outcome.ok {
            status.last_checkin_time = Some(outcome.timestamp.to_rfc3339());
        }
        self.write(status).await
    }

    /// Record a terminal failure.
    pub async fn record_failure(&self, error: &TelemetryError) -> Result<()> {
        let mut status = self.load_or_default().await;
        status.last_error = Some(ErrorRecord::from_error(error));
        self.write(status).await
    }

    /// Atomically persist the status: serialize to a `.tmp` file, then
    /// rename over the final path so the file is always complete.
    async fn write(&self, status: SyncStatus) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let stored = StoredStatus::new(status);
        let content =
            serde_json::to_string_pretty(&stored).context("serializing sync status")?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &content)
            .await
            .with_context(|| format!("writing temp file {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| {
                format!("renaming {} to {}", tmp_path.display(), self.path.display())
            })?;

        Ok(())
    }
}

// ── Health summary ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Error,
    Unknown,
}

/// Derived view over the persisted status, served to the status UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub health: Health,
    pub summary: String,
    pub reason: Option<String>,
    pub last_successful_sync_time: Option<DateTime<Utc>>,
    pub last_attempt_time: Option<DateTime<Utc>>,
}

/// Classify the sync state: a recorded error wins, then a non-ok response,
/// then staleness of the last success, then healthy. No records at all
/// means the first sync hasn't happened yet.
pub fn summarize_health(status: &SyncStatus, now: DateTime<Utc>) -> HealthSummary {
    let last_successful_sync_time = status
        .last_response
        .as_ref()
        .filter(|r| r.ok)
        .map(|r| r.timestamp);
    let last_attempt_time = status
        .last_error
        .as_ref()
        .map(|e| e.timestamp)
        .or_else(|| status.last_response.as_ref().map(|r| r.timestamp));

    let (health, summary, reason) = if let Some(error) = &status.last_error {
        (
            Health::Error,
            "The last sync attempt failed.".to_string(),
            Some(error.message.clone()),
        )
    } else if let Some(response) = &status.last_response {
        if response.ok {
            let staleness_minutes = last_successful_sync_time
                .map(|t| now.signed_duration_since(t).num_minutes())
                .unwrap_or(0);
            if staleness_minutes > STALE_THRESHOLD_MINUTES {
                (
                    Health::Degraded,
                    "Device sync is stale. A new check-in is recommended.".to_string(),
                    Some(format!(
                        "Last successful sync {} minutes ago.",
                        staleness_minutes
                    )),
                )
            } else {
                (
                    Health::Healthy,
                    "Device is syncing normally.".to_string(),
                    None,
                )
            }
        } else {
            (
                Health::Error,
                "The last sync response indicated a problem.".to_string(),
                Some(format!("Received status {}.", response.status)),
            )
        }
    } else {
        (
            Health::Unknown,
            "Awaiting first device sync.".to_string(),
            None,
        )
    };

    HealthSummary {
        health,
        summary,
        reason,
        last_successful_sync_time,
        last_attempt_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn outcome(status: u16, ok: bool) -> TransmissionOutcome {
        TransmissionOutcome {
            status,
            ok,
            body: None,
            request_id: "req-1".to_string(),
            trace_id: None,
            attempts: 1,
            recommended_delay_minutes: None,
            timestamp: Utc::now(),
        }
    }

    fn store() -> (tempfile::TempDir, StatusStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("status.json"));
        (dir, store)
    }

    #[tokio::test]
    async fn success_clears_error_and_sets_checkin() {
        let (_dir, store) = store();

        store
            .record_failure(&TelemetryError::RetryableServer { status: 503 })
            .await
            .unwrap();
        let status = store.load().await.unwrap();
        assert!(status.last_error.is_some());
        assert!(status.last_checkin_time.is_none());

        store.record_response(&outcome(200, true)).await.unwrap();
        let status = store.load().await.unwrap();
        assert!(status.last_error.is_none());
        assert!(status.last_checkin_time.is_some());
        assert_eq!(status.last_response.unwrap().status, 200);
    }

    #[tokio::test]
    async fn terminal_response_supersedes_older_error() {
        let (_dir, store) = store();

        store
            .record_failure(&TelemetryError::Timeout { ms: 15_000 })
            .await
            .unwrap();
        store.record_response(&outcome(404, false)).await.unwrap();

        // The newer terminal response is authoritative.
        let status = store.load().await.unwrap();
        assert!(status.last_error.is_none());
        let summary = summarize_health(&status, Utc::now());
        assert_eq!(summary.health, Health::Error);
        assert_eq!(summary.reason.as_deref(), Some("Received status 404."));
    }

    #[tokio::test]
    async fn failed_response_keeps_checkin_untouched() {
        let (_dir, store) = store();
        store.record_response(&outcome(200, true)).await.unwrap();
        let before = store.load().await.unwrap().last_checkin_time;

        store.record_response(&outcome(404, false)).await.unwrap();
        let status = store.load().await.unwrap();
        assert_eq!(status.last_checkin_time, before);
        assert!(!status.last_response.unwrap().ok);
    }

    #[tokio::test]
    async fn tampered_file_is_rejected() {
        let (_dir, store) = store();
        store.record_response(&outcome(200, true)).await.unwrap();

        let content = tokio::fs::read_to_string(&store.path).await.unwrap();
        let tampered = content.replace("\"status\": 200", "\"status\": 500");
        tokio::fs::write(&store.path, tampered).await.unwrap();

        assert!(store.load().await.is_err());
        // The degrading reader falls back to empty rather than failing
        let status = store.load_or_default().await;
        assert!(status.last_response.is_none());
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let (_dir, store) = store();
        let status = store.load().await.unwrap();
        assert!(status.last_response.is_none());
        assert!(status.last_error.is_none());
    }

    #[test]
    fn health_prefers_error_record() {
        let now = Utc::now();
        let status = SyncStatus {
            last_response: Some(TransmissionRecord::from(&outcome(200, true))),
            last_error: Some(ErrorRecord {
                message: "network failure: reset".to_string(),
                kind: "network-failure".to_string(),
                timestamp: now,
            }),
            last_checkin_time: None,
        };
        let summary = summarize_health(&status, now);
        assert_eq!(summary.health, Health::Error);
        assert_eq!(summary.reason.as_deref(), Some("network failure: reset"));
    }

    #[test]
    fn health_degrades_when_stale() {
        let now = Utc::now();
        let mut record = TransmissionRecord::from(&outcome(200, true));
        record.timestamp = now - Duration::minutes(STALE_THRESHOLD_MINUTES + 30);
        let status = SyncStatus {
            last_response: Some(record),
            last_error: None,
            last_checkin_time: None,
        };
        let summary = summarize_health(&status, now);
        assert_eq!(summary.health, Health::Degraded);
    }

    #[test]
    fn health_unknown_before_first_sync() {
        let summary = summarize_health(&SyncStatus::default(), Utc::now());
        assert_eq!(summary.health, Health::Unknown);
        assert_eq!(summary.last_attempt_time, None);
    }

    #[test]
    fn non_ok_response_is_error() {
        let now = Utc::now();
        let status = SyncStatus {
            last_response: Some(TransmissionRecord::from(&outcome(403, false))),
            last_error: None,
            last_checkin_time: None,
        };
        let summary = summarize_health(&status, now);
        assert_eq!(summary.health, Health::Error);
        assert_eq!(summary.reason.as_deref(), Some("Received status 403."));
    }
}
