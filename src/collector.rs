//! Device snapshot collection.
//!
//! Every attribute is independently optional: a host that cannot provide a
//! value (no DMI access, no managed identity files, headless user) yields
//! `None` for that field rather than failing the snapshot. The snapshot is
//! rebuilt fresh for every transmission attempt, never cached.

use std::net::UdpSocket;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Identity attributes reported to the tenant. Field names match the wire
/// contract of the telemetry endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub asset_tag: Option<String>,
    pub serial_number: Option<String>,
    pub directory_device_id: Option<String>,
    pub current_user: Option<String>,
    pub os_version: Option<String>,
    pub local_ip_address: Option<String>,
    /// ISO-8601 timestamp of the last successful check-in.
    pub last_checkin_time: Option<String>,
}

/// Host-provided device attribute getters. Each is independently optional.
#[async_trait]
pub trait DeviceAttributes: Send + Sync {
    async fn asset_tag(&self) -> Option<String>;
    async fn serial_number(&self) -> Option<String>;
    async fn directory_device_id(&self) -> Option<String>;
    async fn current_user(&self) -> Option<String>;
    async fn os_version(&self) -> Option<String>;
    async fn local_ip_address(&self) -> Option<String>;
}

/// Build a fresh snapshot from the host attribute provider.
///
/// `last_checkin_time` comes from the persisted status store; the pipeline
/// overwrites it with the current timestamp just before transmitting.
pub async fn collect(
    attrs: &dyn DeviceAttributes,
    last_checkin_time: Option<String>,
) -> DeviceSnapshot {
    let (asset_tag, serial_number, directory_device_id, current_user, os_version, local_ip_address) = tokio::join!(
        attrs.asset_tag(),
        attrs.serial_number(),
        attrs.directory_device_id(),
        attrs.current_user(),
        attrs.os_version(),
        attrs.local_ip_address(),
    );

    DeviceSnapshot {
        asset_tag,
        serial_number,
        directory_device_id,
        current_user,
        os_version,
        local_ip_address,
        last_checkin_time,
    }
}

// ── Host implementation ────────────────────────────────────

const DMI_SERIAL_PATH: &str = "/sys/class/dmi/id/product_serial";
const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Reads attributes from the local host: DMI sysfs for the serial number,
/// well-known files under /etc/iiq-companion for enrollment identity,
/// os-release for the OS version.
pub struct HostDeviceAttributes {
    asset_tag_file: PathBuf,
    device_id_file: PathBuf,
}

impl Default for HostDeviceAttributes {
    fn default() -> Self {
        Self {
            asset_tag_file: PathBuf::from("/etc/iiq-companion/asset-tag"),
            device_id_file: PathBuf::from("/etc/iiq-companion/device-id"),
        }
    }
}

impl HostDeviceAttributes {
    async fn read_trimmed(path: &std::path::Path) -> Option<String> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Err(_) => None,
        }
    }
}

#[async_trait]
impl DeviceAttributes for HostDeviceAttributes {
    async fn asset_tag(&self) -> Option<String> {
        Self::read_trimmed(&self.asset_tag_file).await
    }

    async fn serial_number(&self) -> Option<String> {
        let serial = Self::read_trimmed(std::path::Path::new(DMI_SERIAL_PATH)).await?;
        // Some firmware reports placeholder serials
        if serial.eq_ignore_ascii_case("to be filled by o.e.m.") || serial == "None" {
            return None;
        }
        Some(serial)
    }

    async fn directory_device_id(&self) -> Option<String> {
        Self::read_trimmed(&self.device_id_file).await
    }

    async fn current_user(&self) -> Option<String> {
        std::env::var("USER")
            .ok()
            .filter(|u| !u.is_empty())
    }

    async fn os_version(&self) -> Option<String> {
        let content = tokio::fs::read_to_string(OS_RELEASE_PATH).await.ok()?;
        let pretty = parse_os_release_field(&content, "PRETTY_NAME");
        if pretty.is_some() {
            return pretty;
        }
        let name = parse_os_release_field(&content, "NAME")?;
        match parse_os_release_field(&content, "VERSION_ID") {
            Some(version) => Some(format!("{} {}", name, version)),
            None => Some(name),
        }
    }

    async fn local_ip_address(&self) -> Option<String> {
        match local_ip() {
            Some(ip) => Some(ip),
            None => {
                warn!("could not determine a non-loopback local IP address");
                None
            }
        }
    }
}

fn parse_os_release_field(content: &str, field: &str) -> Option<String> {
    content
        .lines()
        .find(|l| l.starts_with(&format!("{}=", field)))
        .map(|l| {
            l.split('=')
                .nth(1)
                .unwrap_or("")
                .trim_matches('"')
                .to_string()
        })
        .filter(|v| !v.is_empty())
}

/// Determine the local IP by opening a UDP socket toward a public address.
/// No packet is sent; the OS just picks the outbound interface.
fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    let addr = socket.local_addr().ok()?;
    if addr.ip().is_loopback() {
        return None;
    }
    Some(addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubAttributes;

    #[async_trait]
    impl DeviceAttributes for StubAttributes {
        async fn asset_tag(&self) -> Option<String> {
            Some("ASSET-123".to_string())
        }
        async fn serial_number(&self) -> Option<String> {
            Some("SERIAL-123".to_string())
        }
        async fn directory_device_id(&self) -> Option<String> {
            None
        }
        async fn current_user(&self) -> Option<String> {
            Some("user@example.com".to_string())
        }
        async fn os_version(&self) -> Option<String> {
            Some("ChromeOS Flex 14816.66.0".to_string())
        }
        async fn local_ip_address(&self) -> Option<String> {
            Some("192.168.0.10".to_string())
        }
    }

    #[tokio::test]
    async fn collect_maps_every_attribute() {
        let snapshot = collect(&StubAttributes, Some("2024-01-01T00:00:00Z".to_string())).await;
        assert_eq!(snapshot.asset_tag.as_deref(), Some("ASSET-123"));
        assert_eq!(snapshot.serial_number.as_deref(), Some("SERIAL-123"));
        assert_eq!(snapshot.directory_device_id, None);
        assert_eq!(snapshot.current_user.as_deref(), Some("user@example.com"));
        assert_eq!(
            snapshot.last_checkin_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snapshot = DeviceSnapshot {
            serial_number: Some("SN1".to_string()),
            asset_tag: Some("A1".to_string()),
            ..DeviceSnapshot::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["serialNumber"], "SN1");
        assert_eq!(json["assetTag"], "A1");
        assert!(json["directoryDeviceId"].is_null());
    }

    #[test]
    fn os_release_field_parsing() {
        let content = "NAME=\"Ubuntu\"\nVERSION_ID=\"24.04\"\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\n";
        assert_eq!(
            parse_os_release_field(content, "PRETTY_NAME").as_deref(),
            Some("Ubuntu 24.04 LTS")
        );
        assert_eq!(parse_os_release_field(content, "BUILD_ID"), None);
    }
}
