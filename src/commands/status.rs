//! `iiq-companion status` — show the persisted sync status and its derived
//! health classification.

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;

use crate::status::{summarize_health, Health, StatusStore};

pub fn run(format: &str) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(format))
}

async fn run_async(format: &str) -> Result<()> {
    let store = StatusStore::new(StatusStore::default_path()?);
    let status = store.load().await?;
    let health = summarize_health(&status, Utc::now());

    match format {
        "json" => {
            let view = serde_json::json!({ "health": health, "status": status });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        _ => {
            let label = match health.health {
                Health::Healthy => "healthy".green(),
                Health::Degraded => "degraded".yellow(),
                Health::Error => "error".red(),
                Health::Unknown => "unknown".dimmed(),
            };
            println!("Device sync: {} — {}", label, health.summary);
            if let Some(reason) = &health.reason {
                println!("  {} {}", "Reason:".dimmed(), reason);
            }
            if let Some(t) = &health.last_successful_sync_time {
                println!("  {} {}", "Last successful sync:".dimmed(), t.to_rfc3339());
            }
            if let Some(t) = &health.last_attempt_time {
                println!("  {} {}", "Last attempt:".dimmed(), t.to_rfc3339());
            }
            if let Some(response) = &status.last_response {
                println!(
                    "  {} HTTP {} after {} attempt(s), request {}",
                    "Last response:".dimmed(),
                    response.status,
                    response.attempts,
                    response.request_id
                );
            }
        }
    }
    Ok(())
}
