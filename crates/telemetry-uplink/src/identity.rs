use std::fs;
use std::path::Path;

use tracing::warn;

/// Overrides hardware-derived identity (containers, bench rigs).
pub const ENV_DEVICE_ID: &str = "TELEMETRY_DEVICE_ID";

const SYSFS_NET: &str = "/sys/class/net";
const MACHINE_ID: &str = "/etc/machine-id";

/// Stable device identifier, derived once at startup.
///
/// Order: the override variable, the first non-loopback MAC address, the
/// machine id. Nothing is persisted; the same hardware always yields the
/// same id.
pub fn device_id() -> String {
    if let Some(id) = std::env::var(ENV_DEVICE_ID)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        return id;
    }

    if let Some(mac) = first_mac(Path::new(SYSFS_NET)) {
        return format_mac_id(&mac);
    }

    if let Some(id) = machine_id(Path::new(MACHINE_ID)) {
        return id;
    }

    warn!("No hardware identity found, using an all-zero device id");
    format_mac_id(&[0u8; 6])
}

/// `node-` followed by the 48-bit MAC in upper-case hex.
pub fn format_mac_id(mac: &[u8; 6]) -> String {
    format!("node-{}", hex::encode_upper(mac))
}

/// First usable interface MAC under a sysfs-style `net` directory, by
/// interface name order. Loopback and all-zero addresses are ignored.
pub fn first_mac(net_dir: &Path) -> Option<[u8; 6]> {
    let mut names: Vec<_> = fs::read_dir(net_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    names.iter().find_map(|name| {
        let raw = fs::read_to_string(net_dir.join(name).join("address")).ok()?;
        parse_mac(raw.trim()).filter(|mac| mac.iter().any(|b| *b != 0))
    })
}

fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

fn machine_id(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let hex: String = raw.trim().chars().take(12).collect();
    if hex.len() == 12 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("node-{}", hex.to_ascii_uppercase()))
    } else {
        None
    }
}
