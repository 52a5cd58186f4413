//! `iiq-companion push` — run a single telemetry transmission and print the
//! outcome. Persists the same status record the daemon would.

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use colored::Colorize;

use crate::collector::{self, HostDeviceAttributes};
use crate::config::{self, ConfigPaths};
use crate::status::StatusStore;
use crate::telemetry::auth::{CredentialResolver, HttpTokenProvider};
use crate::telemetry::transmitter::{TransmissionOutcome, Transmitter};

pub fn run(format: &str) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(format))
}

async fn run_async(format: &str) -> Result<()> {
    let config_paths = ConfigPaths::default_paths()?;
    let settings = config::load_effective(&config_paths)?;
    let status = StatusStore::new(StatusStore::default_path()?);

    let http = reqwest::Client::builder()
        .build()
        .context("building HTTP client")?;
    let resolver = CredentialResolver::new(HttpTokenProvider::new(http));
    let transmitter = Transmitter::new(resolver)?;

    let stored = status.load_or_default().await;
    let mut snapshot =
        collector::collect(&HostDeviceAttributes::default(), stored.last_checkin_time).await;
    snapshot.last_checkin_time = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));

    match transmitter.send_telemetry(&settings, &snapshot).await {
        Ok(outcome) => {
            status.record_response(&outcome).await?;
            print_outcome(&outcome, format)?;
            if !outcome.ok {
                bail!("telemetry push returned HTTP {}", outcome.status);
            }
            Ok(())
        }
        Err(e) => {
            status.record_failure(&e).await?;
            Err(e).context("telemetry push failed")
        }
    }
}

fn print_outcome(outcome: &TransmissionOutcome, format: &str) -> Result<()> {
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(outcome)?);
        }
        _ => {
            let verdict = if outcome.ok {
                "ok".green()
            } else {
                format!("failed (HTTP {})", outcome.status).red()
            };
            println!("Telemetry push: {}", verdict);
            println!(
                "  {} {}  {} {}",
                "Attempts:".dimmed(),
                outcome.attempts,
                "Request id:".dimmed(),
                outcome.request_id
            );
            if let Some(trace_id) = &outcome.trace_id {
                println!("  {} {}", "Trace id:".dimmed(), trace_id);
            }
            if let Some(minutes) = outcome.recommended_delay_minutes {
                println!("  {} {} minutes", "Next check recommended in:".dimmed(), minutes);
            }
        }
    }
    Ok(())
}
