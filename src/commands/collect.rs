//! `iiq-companion collect` — build and print the device snapshot without
//! transmitting anything.

use anyhow::Result;
use colored::Colorize;

use crate::collector::{self, DeviceSnapshot, HostDeviceAttributes};
use crate::status::StatusStore;

pub fn run(format: &str) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(format))
}

async fn run_async(format: &str) -> Result<()> {
    let store = StatusStore::new(StatusStore::default_path()?);
    let last_checkin = store.load_or_default().await.last_checkin_time;
    let snapshot = collector::collect(&HostDeviceAttributes::default(), last_checkin).await;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        _ => print_table(&snapshot),
    }
    Ok(())
}

fn print_table(snapshot: &DeviceSnapshot) {
    let row = |label: &str, value: &Option<String>| {
        println!(
            "  {:<22} {}",
            label.dimmed(),
            value.as_deref().unwrap_or("(unavailable)")
        );
    };

    println!("Device snapshot:");
    row("Asset tag:", &snapshot.asset_tag);
    row("Serial number:", &snapshot.serial_number);
    row("Directory device id:", &snapshot.directory_device_id);
    row("Current user:", &snapshot.current_user);
    row("OS version:", &snapshot.os_version);
    row("Local IP:", &snapshot.local_ip_address);
    row("Last check-in:", &snapshot.last_checkin_time);
}
