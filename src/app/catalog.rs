use std::fs;
use std::path::Path;

use plist::{Dictionary, Value};
use tracing::{debug, warn};

use crate::app::models::BackupRecord;

/// Result of scanning a backup root. Corrupt entries never abort the scan;
/// they are only counted.
#[derive(Debug, Default)]
pub struct CatalogScan {
    pub records: Vec<BackupRecord>,
    pub skipped: usize,
}

impl CatalogScan {
    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.total_bytes).sum()
    }
}

/// Walks `root/<udid>/<backup-id>/` two levels deep and collects every
/// parseable backup. A directory without a readable metadata plist counts
/// as skipped.
pub fn scan_backup_root(root: &Path) -> CatalogScan {
    let mut scan = CatalogScan::default();

    let Ok(udid_dirs) = fs::read_dir(root) else {
        debug!(root = %root.display(), "backup root not readable");
        return scan;
    };

    for udid_entry in udid_dirs.flatten() {
        if !udid_entry.path().is_dir() {
            continue;
        }
        let udid = udid_entry.file_name().to_string_lossy().into_owned();
        let Ok(backup_dirs) = fs::read_dir(udid_entry.path()) else {
            scan.skipped += 1;
            continue;
        };
        for backup_entry in backup_dirs.flatten() {
            let path = backup_entry.path();
            if !path.is_dir() {
                continue;
            }
            match read_backup_record(&path, &udid) {
                Some(record) => scan.records.push(record),
                None => {
                    warn!(path = %path.display(), "skipping unreadable backup entry");
                    scan.skipped += 1;
                }
            }
        }
    }

    scan
}

/// `Info.plist` is authoritative; `Manifest.plist` (its `Lockdown`
/// sub-dict) is the fallback for trees where Info.plist is gone.
fn read_backup_record(dir: &Path, udid: &str) -> Option<BackupRecord> {
    let metadata = read_info_metadata(dir).or_else(|| read_manifest_metadata(dir))?;

    Some(BackupRecord {
        path: dir.to_path_buf(),
        udid: udid.to_string(),
        device_name: metadata.device_name,
        product_type: metadata.product_type,
        ios_version: metadata.ios_version,
        total_bytes: directory_size(dir),
        backup_time: metadata.backup_time,
    })
}

struct BackupMetadata {
    device_name: String,
    product_type: String,
    ios_version: String,
    backup_time: Option<std::time::SystemTime>,
}

fn read_info_metadata(dir: &Path) -> Option<BackupMetadata> {
    let value = Value::from_file(dir.join("Info.plist")).ok()?;
    let dict = value.as_dictionary()?;
    Some(BackupMetadata {
        device_name: string_of(dict, "Device Name")
            .or_else(|| string_of(dict, "Display Name"))
            .unwrap_or_default(),
        product_type: string_of(dict, "Product Type").unwrap_or_default(),
        ios_version: string_of(dict, "Product Version").unwrap_or_default(),
        backup_time: dict
            .get("Last Backup Date")
            .and_then(Value::as_date)
            .map(std::time::SystemTime::from),
    })
}

fn read_manifest_metadata(dir: &Path) -> Option<BackupMetadata> {
    let value = Value::from_file(dir.join("Manifest.plist")).ok()?;
    let dict = value.as_dictionary()?;
    let lockdown = dict.get("Lockdown").and_then(Value::as_dictionary)?;
    Some(BackupMetadata {
        device_name: string_of(lockdown, "DeviceName").unwrap_or_default(),
        product_type: string_of(lockdown, "ProductType").unwrap_or_default(),
        ios_version: string_of(lockdown, "ProductVersion").unwrap_or_default(),
        backup_time: None,
    })
}

fn string_of(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key).and_then(Value::as_string).map(str::to_string)
}

/// Recursive size of regular files. Unreadable subtrees are logged and the
/// partial sum kept.
fn directory_size(dir: &Path) -> u64 {
    let mut total = 0u64;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "size scan failed, keeping partial sum");
            return total;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.metadata() {
            Ok(meta) if meta.is_dir() => total += directory_size(&path),
            Ok(meta) if meta.is_file() => total += meta.len(),
            Ok(_) => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "size scan failed for entry");
            }
        }
    }
    total
}
