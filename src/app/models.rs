use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    Android,
    Apple,
    #[default]
    Unknown,
}

impl DeviceType {
    /// Uppercase tag used by the persisted snapshot formats.
    pub fn as_upper(&self) -> &'static str {
        match self {
            DeviceType::Android => "ANDROID",
            DeviceType::Apple => "IOS",
            DeviceType::Unknown => "UNKNOWN",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Android => "Android",
            DeviceType::Apple => "iOS",
            DeviceType::Unknown => "Unknown",
        }
    }
}

/// One tracked device. `uid` is the ADB serial for Android and the UDID for
/// Apple; it never changes once the device has been observed. Every other
/// field is enrichment and may arrive later, possibly from a different
/// provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub uid: String,
    pub display_name: String,
    pub manufacturer: String,
    pub model: String,
    pub os_version: String,
    pub abi: String,
    pub adb_state: String,
    pub transport: String,
    pub vid: u16,
    pub pid: u16,
    pub usb_path: String,
    pub online: bool,
}

impl DeviceInfo {
    /// Monotonic merge: a known non-empty field is never overwritten by an
    /// empty one. `online` is plain state and always follows the incoming
    /// snapshot.
    pub fn merge_from(&mut self, incoming: &DeviceInfo) {
        if incoming.device_type != DeviceType::Unknown {
            self.device_type = incoming.device_type;
        }
        merge_str(&mut self.display_name, &incoming.display_name);
        merge_str(&mut self.manufacturer, &incoming.manufacturer);
        merge_str(&mut self.model, &incoming.model);
        merge_str(&mut self.os_version, &incoming.os_version);
        merge_str(&mut self.abi, &incoming.abi);
        merge_str(&mut self.adb_state, &incoming.adb_state);
        merge_str(&mut self.transport, &incoming.transport);
        merge_str(&mut self.usb_path, &incoming.usb_path);
        if incoming.vid != 0 {
            self.vid = incoming.vid;
        }
        if incoming.pid != 0 {
            self.pid = incoming.pid;
        }
        self.online = incoming.online;
    }
}

fn merge_str(current: &mut String, incoming: &str) {
    if !incoming.is_empty() {
        *current = incoming.to_string();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Attach,
    Detach,
    InfoUpdated,
}

impl EventKind {
    /// Short tag used in notifier JSON lines.
    pub fn as_tag(&self) -> &'static str {
        match self {
            EventKind::Attach => "attach",
            EventKind::Detach => "detach",
            EventKind::InfoUpdated => "info",
        }
    }
}

/// A registry event together with the device snapshot captured at event
/// time. Detach events always carry `online = false`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: EventKind,
    pub info: DeviceInfo,
}

impl DeviceEvent {
    pub fn new(kind: EventKind, info: DeviceInfo) -> Self {
        Self { kind, info }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupOptions {
    pub backup_dir: PathBuf,
    pub full_backup: bool,
    pub encrypt: bool,
}

impl BackupOptions {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            full_backup: true,
            encrypt: false,
        }
    }
}

/// One backup found on disk by the catalog scanner. Derived purely from the
/// directory tree and its metadata plists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub udid: String,
    pub device_name: String,
    pub product_type: String,
    pub ios_version: String,
    pub total_bytes: u64,
    #[serde(skip)]
    pub backup_time: Option<SystemTime>,
}
