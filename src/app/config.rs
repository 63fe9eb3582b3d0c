use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_ADB_HOST: &str = "127.0.0.1";
pub const DEFAULT_ADB_PORT: u16 = 5037;
pub const DEFAULT_DEBOUNCE_MS: u64 = 800;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// ADB server endpoint; always loopback in practice.
    pub adb_host: String,
    pub adb_port: u16,
    /// Registry debounce window in milliseconds.
    pub debounce_ms: u64,
    /// Webhook URL for the external notifier; empty disables the channel.
    pub webhook_url: String,
    /// `host:port` NDJSON push endpoint; empty disables the channel.
    pub notify_tcp: String,
    /// Root directory for new backups and the catalog scan.
    pub backup_root: PathBuf,
    /// Path override for an external backup helper. Surfaced for the
    /// fallback tooling only; the in-process protocol driver ignores it.
    pub idevicebackup2_exe: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adb_host: DEFAULT_ADB_HOST.to_string(),
            adb_port: DEFAULT_ADB_PORT,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            webhook_url: String::new(),
            notify_tcp: String::new(),
            backup_root: default_backup_root(dirs::home_dir()),
            idevicebackup2_exe: String::new(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        let (host, port) = resolve_adb_endpoint(
            std::env::var("ADB_SERVER_SOCKET").ok().as_deref(),
            std::env::var("ADB_SERVER_HOST").ok().as_deref(),
            std::env::var("ADB_HOST").ok().as_deref(),
            std::env::var("ADB_SERVER_PORT").ok().as_deref(),
        );
        config.adb_host = host;
        config.adb_port = port;

        if let Ok(url) = std::env::var("DEVICE_NOTIFY_WEBHOOK") {
            config.webhook_url = url.trim().to_string();
        }
        if let Ok(endpoint) = std::env::var("DEVICE_NOTIFY_TCP") {
            config.notify_tcp = endpoint.trim().to_string();
        }
        if let Ok(exe) = std::env::var("IDEVICEBACKUP2_EXE") {
            config.idevicebackup2_exe = exe.trim().to_string();
        }
        if let Ok(root) = std::env::var("DEVICE_BACKUP_ROOT") {
            let trimmed = root.trim();
            if !trimmed.is_empty() {
                config.backup_root = PathBuf::from(trimmed);
            }
        }

        validate(config)
    }

    pub fn adb_endpoint(&self) -> String {
        format!("{}:{}", self.adb_host, self.adb_port)
    }
}

fn default_backup_root(home: Option<PathBuf>) -> PathBuf {
    match home {
        Some(dir) => dir.join("DeviceWatcherBackups"),
        None => PathBuf::from("DeviceWatcherBackups"),
    }
}

/// `ADB_SERVER_SOCKET=tcp:HOST:PORT` beats the individual variables.
/// Otherwise `ADB_SERVER_HOST` is read first and the compatibility spelling
/// `ADB_HOST` after it, so the latter wins when both are set.
fn resolve_adb_endpoint(
    socket: Option<&str>,
    server_host: Option<&str>,
    compat_host: Option<&str>,
    server_port: Option<&str>,
) -> (String, u16) {
    if let Some(spec) = socket {
        if let Some((host, port)) = parse_socket_spec(spec) {
            return (host, port);
        }
        warn!(spec = %spec, "ignoring malformed ADB_SERVER_SOCKET");
    }

    let mut host = DEFAULT_ADB_HOST.to_string();
    for candidate in [server_host, compat_host].into_iter().flatten() {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            host = trimmed.to_string();
        }
    }

    let mut port = DEFAULT_ADB_PORT;
    if let Some(value) = server_port {
        match value.trim().parse::<u16>() {
            Ok(parsed) if parsed != 0 => port = parsed,
            _ => warn!(value = %value, "ignoring malformed ADB_SERVER_PORT"),
        }
    }

    (host, port)
}

fn parse_socket_spec(spec: &str) -> Option<(String, u16)> {
    let rest = spec.trim().strip_prefix("tcp:")?;
    let (host, port) = rest.rsplit_once(':')?;
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

fn validate(mut config: AppConfig) -> AppConfig {
    if config.adb_host.trim().is_empty() {
        config.adb_host = DEFAULT_ADB_HOST.to_string();
    }
    if config.adb_port == 0 {
        config.adb_port = DEFAULT_ADB_PORT;
    }
    if config.debounce_ms == 0 {
        config.debounce_ms = DEFAULT_DEBOUNCE_MS;
    }
    config
}
