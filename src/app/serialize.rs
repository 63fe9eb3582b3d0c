use std::fs;
use std::io;
use std::path::Path;

use crate::app::models::DeviceInfo;

/// Pretty-printed JSON snapshot of the device list, two-space indent.
pub fn write_devices_json(path: &Path, devices: &[DeviceInfo]) -> io::Result<()> {
    ensure_parent(path)?;
    let entries: Vec<serde_json::Value> = devices
        .iter()
        .map(|device| {
            serde_json::json!({
                "type": device.device_type.as_upper(),
                "uid": device.uid,
                "manufacturer": device.manufacturer,
                "model": device.model,
                "osVersion": device.os_version,
                "abi": device.abi,
                "online": device.online,
            })
        })
        .collect();
    let body = serde_json::to_string_pretty(&entries).map_err(io::Error::other)?;
    fs::write(path, body)
}

/// RFC-4180 CSV snapshot with a fixed header row.
pub fn write_devices_csv(path: &Path, devices: &[DeviceInfo]) -> io::Result<()> {
    ensure_parent(path)?;
    let mut out = String::from("type,uid,manufacturer,model,osVersion,abi,online\n");
    for device in devices {
        out.push_str(&csv_escape(device.device_type.as_upper()));
        out.push(',');
        out.push_str(&csv_escape(&device.uid));
        out.push(',');
        out.push_str(&csv_escape(&device.manufacturer));
        out.push(',');
        out.push_str(&csv_escape(&device.model));
        out.push(',');
        out.push_str(&csv_escape(&device.os_version));
        out.push(',');
        out.push_str(&csv_escape(&device.abi));
        out.push(',');
        out.push_str(if device.online { "true" } else { "false" });
        out.push('\n');
    }
    fs::write(path, out)
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Quotes a field when it contains a comma, quote or line break; embedded
/// quotes are doubled.
fn csv_escape(field: &str) -> String {
    let needs_quotes = field.contains([',', '"', '\n', '\r']);
    if !needs_quotes {
        return field.to_string();
    }
    let mut escaped = String::with_capacity(field.len() + 4);
    escaped.push('"');
    for ch in field.chars() {
        if ch == '"' {
            escaped.push('"');
        }
        escaped.push(ch);
    }
    escaped.push('"');
    escaped
}
