//! Telemetry pipeline — top-level controller for periodic device check-ins.
//!
//! The controller is a single-consumer event loop: one pending deadline and
//! one command channel, so at most one transmission is ever in flight and
//! re-arming replaces the pending firing. A tokio mutex additionally guards
//! the transmit-and-reschedule sequence, making the exclusive-execution
//! guarantee explicit on the multi-threaded runtime.

pub mod auth;
pub mod error;
pub mod scheduler;
pub mod transmitter;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::collector::{self, DeviceAttributes};
use crate::config::{self, ConfigPaths, EffectiveSettings};
use crate::status::StatusStore;

use auth::TokenProvider;
use scheduler::ScheduleRequest;
use transmitter::Transmitter;

/// External events the running pipeline reacts to.
#[derive(Debug, Clone, Copy)]
pub enum PipelineCommand {
    /// Run a transmission immediately (status UI "sync now").
    PushNow,
    /// Settings changed: clear cached credentials, push, reschedule.
    RefreshConfig,
}

/// Cloneable sender half used by the REST API and CLI.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<PipelineCommand>,
}

impl PipelineHandle {
    pub async fn push_now(&self) -> Result<()> {
        self.tx
            .send(PipelineCommand::PushNow)
            .await
            .context("telemetry pipeline is not running")
    }

    pub async fn refresh_config(&self) -> Result<()> {
        self.tx
            .send(PipelineCommand::RefreshConfig)
            .await
            .context("telemetry pipeline is not running")
    }
}

pub struct TelemetryPipeline<P: TokenProvider, A: DeviceAttributes> {
    transmitter: Transmitter<P>,
    attributes: A,
    status: Arc<StatusStore>,
    config_paths: ConfigPaths,
    initialized: AtomicBool,
    transmit_lock: Mutex<()>,
}

impl<P: TokenProvider, A: DeviceAttributes> TelemetryPipeline<P, A> {
    pub fn new(
        transmitter: Transmitter<P>,
        attributes: A,
        status: Arc<StatusStore>,
        config_paths: ConfigPaths,
    ) -> Self {
        Self {
            transmitter,
            attributes,
            status,
            config_paths,
            initialized: AtomicBool::new(false),
            transmit_lock: Mutex::new(()),
        }
    }

    pub fn channel() -> (PipelineHandle, mpsc::Receiver<PipelineCommand>) {
        let (tx, rx) = mpsc::channel(8);
        (PipelineHandle { tx }, rx)
    }

    /// Run the pipeline until the command channel closes. Initializes at
    /// most once per process: an immediate push, then the event loop. A
    /// second call is a no-op.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<PipelineCommand>) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("telemetry pipeline already initialized, ignoring");
            return;
        }

        info!("telemetry pipeline starting with immediate push");
        let mut deadline = Instant::now() + self.push_and_reschedule().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    deadline = Instant::now() + self.push_and_reschedule().await;
                }
                command = commands.recv() => match command {
                    Some(PipelineCommand::PushNow) => {
                        info!("immediate push requested");
                        deadline = Instant::now() + self.push_and_reschedule().await;
                    }
                    Some(PipelineCommand::RefreshConfig) => {
                        info!("configuration refresh requested, clearing cached credentials");
                        let settings = self.load_settings().await;
                        self.transmitter.invalidate_credentials(&settings).await;
                        deadline = Instant::now() + self.push_and_reschedule().await;
                    }
                    None => {
                        info!("command channel closed, telemetry pipeline stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn load_settings(&self) -> EffectiveSettings {
        match config::load_effective(&self.config_paths) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "failed to load settings, using defaults");
                EffectiveSettings::default()
            }
        }
    }

    /// One full cycle under the exclusive lock: resolve settings, build a
    /// fresh snapshot, transmit, persist exactly one status record, and
    /// compute the delay until the next attempt.
    async fn push_and_reschedule(&self) -> Duration {
        let _guard = self.transmit_lock.lock().await;

        let settings = self.load_settings().await;
        let stored = self.status.load_or_default().await;
        let mut snapshot = collector::collect(&self.attributes, stored.last_checkin_time).await;
        snapshot.last_checkin_time =
            Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));

        let request = match self.transmitter.send_telemetry(&settings, &snapshot).await {
            Ok(outcome) => {
                info!(
                    status = outcome.status,
                    ok = outcome.ok,
                    attempts = outcome.attempts,
                    request_id = %outcome.request_id,
                    "telemetry push completed"
                );
                if let Err(e) = self.status.record_response(&outcome).await {
                    warn!(error = %e, "failed to persist sync status");
                }
                ScheduleRequest {
                    recommended_delay_minutes: outcome.recommended_delay_minutes,
                    retry: !outcome.ok,
                }
            }
            Err(e) => {
                error!(kind = e.kind(), error = %e, "telemetry push failed");
                if let Err(persist_err) = self.status.record_failure(&e).await {
                    warn!(error = %persist_err, "failed to persist error record");
                }
                ScheduleRequest {
                    recommended_delay_minutes: None,
                    retry: true,
                }
            }
        };

        let delay = scheduler::next_delay(&settings, &request);
        info!(delay_minutes = delay.as_secs() / 60, "next telemetry push scheduled");
        delay
    }
}
