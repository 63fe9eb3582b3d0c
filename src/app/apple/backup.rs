use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use plist::{Dictionary, Value};
use tracing::{debug, warn};

use crate::app::apple::mb2::{Mb2Client, Mb2Message};
#[cfg(feature = "apple")]
use crate::app::apple::mb2::SUPPORTED_VERSIONS;
use crate::app::error::{BackupError, WireError};
use crate::app::models::{BackupOptions, DeviceInfo, DeviceType};

/// Client label presented to lockdownd and mobilebackup2.
pub const CLIENT_LABEL: &str = "devicewatcher";

/// Filenames over this length abort the upload stream: the framing can no
/// longer be trusted.
const MAX_FILENAME_LEN: u32 = 4096;

const CODE_FILE_DATA: u8 = 0x0c;
const CODE_SUCCESS: u8 = 0x00;
const CODE_ERROR_LOCAL: u8 = 0x06;
const CODE_ERROR_REMOTE: u8 = 0x0b;

/// Operation result reported by the device in the last
/// `DLMessageProcessMessage` before it disconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub error_code: u64,
    pub description: String,
}

/// Sentinel codes the protocol expects in status responses for filesystem
/// failures.
fn errno_code(err: &io::Error) -> i64 {
    match err.kind() {
        io::ErrorKind::NotFound => -6,
        io::ErrorKind::AlreadyExists => -7,
        io::ErrorKind::NotADirectory => -8,
        io::ErrorKind::IsADirectory => -9,
        io::ErrorKind::StorageFull => -15,
        _ => -1,
    }
}

/// Joins a device-supplied relative path onto the backup root. `.`
/// segments are dropped and `..` collapses; anything that would step out of
/// the root is refused.
fn sanitize_relpath(root: &Path, relpath: &str) -> io::Result<PathBuf> {
    let candidate = Path::new(relpath);
    if candidate.is_absolute() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("absolute path not allowed: {relpath}"),
        ));
    }
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("path escapes backup root: {relpath}"),
                    ));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("absolute path not allowed: {relpath}"),
                ));
            }
        }
    }
    let mut joined = root.to_path_buf();
    for part in parts {
        joined.push(part);
    }
    Ok(joined)
}

/// Drives the request/response dance until the device disconnects. Returns
/// the last operation result the device reported, if any. Transport and
/// framing failures abort; filesystem failures are reported back to the
/// device through status codes and the loop continues.
pub fn run_message_loop<S: Read + Write>(
    client: &mut Mb2Client<S>,
    backup_root: &Path,
) -> Result<Option<ProcessResult>, WireError> {
    let mut last_result: Option<ProcessResult> = None;
    loop {
        let message = client.receive_message()?;
        debug!(name = %message.name, "device message");
        match message.name.as_str() {
            "DLMessageUploadFiles" => handle_upload_files(client, backup_root)?,
            "DLMessageGetFreeDiskSpace" => handle_free_disk_space(client, backup_root)?,
            "DLContentsOfDirectory" => {
                handle_contents_of_directory(client, &message, backup_root)?
            }
            "DLMessageCreateDirectory" => handle_create_directory(client, &message, backup_root)?,
            "DLMessageMoveFiles" | "DLMessageMoveItems" => {
                handle_move_items(client, &message, backup_root)?
            }
            "DLMessageRemoveFiles" | "DLMessageRemoveItems" => {
                handle_remove_items(client, &message, backup_root)?
            }
            "DLMessageCopyItem" => handle_copy_item(client, &message, backup_root)?,
            "DLMessageProcessMessage" => {
                last_result = parse_process_message(&message);
            }
            "DLMessageDisconnect" => break,
            other => {
                warn!(name = other, "unhandled device message");
            }
        }
    }
    Ok(last_result)
}

/// The raw upload stream: filename pairs `(domain, relative path)` followed
/// by `(u32 length, u8 code, payload)` blocks per file. A filename length
/// of zero ends the list. Per-file I/O failures are remembered and the
/// remaining blocks drained so the framing survives; the first failure is
/// what the status response reports.
fn handle_upload_files<S: Read + Write>(
    client: &mut Mb2Client<S>,
    backup_root: &Path,
) -> Result<(), WireError> {
    let mut first_error: Option<io::Error> = None;

    loop {
        let Some(_domain) = receive_filename(client)? else {
            break;
        };
        let relpath = receive_filename(client)?.ok_or_else(|| {
            WireError::ProtocolFail("upload stream ended between filename pair".to_string())
        })?;

        let mut sink: Box<dyn Write> = match prepare_upload_target(backup_root, &relpath) {
            Ok(file) => Box::new(file),
            Err(err) => {
                warn!(path = %relpath, error = %err, "cannot write uploaded file");
                if first_error.is_none() {
                    first_error = Some(err);
                }
                Box::new(io::sink())
            }
        };

        receive_file_blocks(client, &relpath, &mut sink, &mut first_error)?;
    }

    match first_error {
        None => client.send_status_response(0, None, None),
        Some(err) => {
            client.send_status_response(errno_code(&err), Some(&err.to_string()), None)
        }
    }
}

fn receive_file_blocks<S: Read + Write>(
    client: &mut Mb2Client<S>,
    relpath: &str,
    sink: &mut Box<dyn Write>,
    first_error: &mut Option<io::Error>,
) -> Result<(), WireError> {
    loop {
        let block_len = client.link.read_raw_u32()?;
        if block_len == 0 {
            return Ok(());
        }
        let code = client.link.read_raw_u8()?;
        let payload_len = u64::from(block_len - 1);
        match code {
            CODE_FILE_DATA => {
                copy_block(client, payload_len, sink, first_error)?;
            }
            CODE_SUCCESS => {
                drain_block(client, payload_len)?;
                return Ok(());
            }
            CODE_ERROR_LOCAL | CODE_ERROR_REMOTE => {
                let detail = read_block_text(client, payload_len)?;
                warn!(path = %relpath, code, detail = %detail, "device reported file error");
                return Ok(());
            }
            other => {
                // Unknown flag: conservatively end the current file.
                warn!(path = %relpath, code = other, "unknown flag in upload stream");
                drain_block(client, payload_len)?;
                return Ok(());
            }
        }
    }
}

/// Copies one data block to the sink. Transport errors abort; sink errors
/// are recorded and the rest of the block is drained.
fn copy_block<S: Read + Write>(
    client: &mut Mb2Client<S>,
    len: u64,
    sink: &mut Box<dyn Write>,
    first_error: &mut Option<io::Error>,
) -> Result<(), WireError> {
    let mut remaining = len;
    let mut chunk = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let take = remaining.min(chunk.len() as u64) as usize;
        client.link.read_raw_exact(&mut chunk[..take])?;
        remaining -= take as u64;
        if let Err(err) = sink.write_all(&chunk[..take]) {
            if first_error.is_none() {
                *first_error = Some(err);
            }
            *sink = Box::new(io::sink());
        }
    }
    Ok(())
}

fn drain_block<S: Read + Write>(client: &mut Mb2Client<S>, len: u64) -> Result<(), WireError> {
    let mut devnull = io::sink();
    client.link.copy_raw_to(len, &mut devnull)
}

fn read_block_text<S: Read + Write>(
    client: &mut Mb2Client<S>,
    len: u64,
) -> Result<String, WireError> {
    if len > u64::from(MAX_FILENAME_LEN) {
        drain_block(client, len)?;
        return Ok(String::new());
    }
    let mut buf = vec![0u8; len as usize];
    client.link.read_raw_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// `None` marks the end of the file list.
fn receive_filename<S: Read + Write>(
    client: &mut Mb2Client<S>,
) -> Result<Option<String>, WireError> {
    let len = client.link.read_raw_u32()?;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FILENAME_LEN {
        return Err(WireError::ProtocolFail(format!(
            "filename length {len} exceeds limit {MAX_FILENAME_LEN}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    client.link.read_raw_exact(&mut buf)?;
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

fn prepare_upload_target(backup_root: &Path, relpath: &str) -> io::Result<File> {
    let target = sanitize_relpath(backup_root, relpath)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::remove_file(&target) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    File::create(&target)
}

fn handle_free_disk_space<S: Read + Write>(
    client: &mut Mb2Client<S>,
    backup_root: &Path,
) -> Result<(), WireError> {
    match free_disk_space(backup_root) {
        Ok(free) => {
            client.send_status_response(0, None, Some(Value::Integer(free.into())))
        }
        Err(err) => {
            client.send_status_response(errno_code(&err), Some(&err.to_string()), None)
        }
    }
}

#[cfg(unix)]
fn free_disk_space(path: &Path) -> io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::other("path contains NUL"))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_disk_space(_path: &Path) -> io::Result<u64> {
    Ok(0)
}

fn handle_contents_of_directory<S: Read + Write>(
    client: &mut Mb2Client<S>,
    message: &Mb2Message,
    backup_root: &Path,
) -> Result<(), WireError> {
    let relpath = message.arg_string(0).unwrap_or_default().to_string();
    let mut listing = Dictionary::new();

    if let Ok(dir) = sanitize_relpath(backup_root, &relpath) {
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                listing.insert(name, directory_entry_value(&entry));
            }
        }
    }

    client.send_status_response(0, None, Some(Value::Dictionary(listing)))
}

fn directory_entry_value(entry: &fs::DirEntry) -> Value {
    let mut dict = Dictionary::new();
    match entry.metadata() {
        Ok(meta) => {
            let file_type = if meta.is_dir() {
                "DLFileTypeDirectory"
            } else if meta.is_file() {
                "DLFileTypeRegular"
            } else {
                "DLFileTypeUnknown"
            };
            dict.insert(
                "DLFileType".to_string(),
                Value::String(file_type.to_string()),
            );
            dict.insert("DLFileSize".to_string(), Value::Integer(meta.len().into()));
            if let Ok(modified) = meta.modified() {
                dict.insert(
                    "DLFileModificationDate".to_string(),
                    Value::Date(plist::Date::from(modified)),
                );
            }
        }
        Err(_) => {
            dict.insert(
                "DLFileType".to_string(),
                Value::String("DLFileTypeUnknown".to_string()),
            );
            dict.insert("DLFileSize".to_string(), Value::Integer(0u64.into()));
        }
    }
    Value::Dictionary(dict)
}

fn handle_create_directory<S: Read + Write>(
    client: &mut Mb2Client<S>,
    message: &Mb2Message,
    backup_root: &Path,
) -> Result<(), WireError> {
    let relpath = message.arg_string(0).unwrap_or_default().to_string();
    let result = sanitize_relpath(backup_root, &relpath).and_then(fs::create_dir_all);
    match result {
        Ok(()) => client.send_status_response(0, None, None),
        // create_dir_all treats EEXIST as success already; anything left is real.
        Err(err) => client.send_status_response(errno_code(&err), Some(&err.to_string()), None),
    }
}

fn handle_move_items<S: Read + Write>(
    client: &mut Mb2Client<S>,
    message: &Mb2Message,
    backup_root: &Path,
) -> Result<(), WireError> {
    let Some(moves) = message.arg_dictionary(0) else {
        return client.send_status_response(-1, Some("malformed move request"), None);
    };

    for (src, dst) in moves.iter() {
        let Some(dst) = dst.as_string() else {
            return client.send_status_response(-1, Some("malformed move target"), None);
        };
        if let Err(err) = move_one(backup_root, src, dst) {
            // Stop at the first failure; the device decides what to retry.
            return client.send_status_response(errno_code(&err), Some(&err.to_string()), None);
        }
    }
    client.send_status_response(0, None, None)
}

fn move_one(backup_root: &Path, src: &str, dst: &str) -> io::Result<()> {
    let from = sanitize_relpath(backup_root, src)?;
    let to = sanitize_relpath(backup_root, dst)?;
    match fs::symlink_metadata(&to) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(&to)?,
        Ok(_) => fs::remove_file(&to)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&from, &to)
}

fn handle_remove_items<S: Read + Write>(
    client: &mut Mb2Client<S>,
    message: &Mb2Message,
    backup_root: &Path,
) -> Result<(), WireError> {
    let Some(items) = message.arg_array(0) else {
        return client.send_status_response(-1, Some("malformed remove request"), None);
    };

    let mut last_error: Option<io::Error> = None;
    for item in items {
        let Some(relpath) = item.as_string() else {
            continue;
        };
        if let Err(err) = remove_one(backup_root, relpath) {
            warn!(path = %relpath, error = %err, "remove failed");
            last_error = Some(err);
        }
    }

    match last_error {
        None => client.send_status_response(0, None, None),
        Some(err) => client.send_status_response(errno_code(&err), Some(&err.to_string()), None),
    }
}

fn remove_one(backup_root: &Path, relpath: &str) -> io::Result<()> {
    let target = sanitize_relpath(backup_root, relpath)?;
    let meta = fs::symlink_metadata(&target)?;
    if meta.is_dir() {
        fs::remove_dir_all(&target)
    } else {
        fs::remove_file(&target)
    }
}

fn handle_copy_item<S: Read + Write>(
    client: &mut Mb2Client<S>,
    message: &Mb2Message,
    backup_root: &Path,
) -> Result<(), WireError> {
    let src = message.arg_string(0).unwrap_or_default().to_string();
    let dst = message.arg_string(1).unwrap_or_default().to_string();
    let result = copy_item(backup_root, &src, &dst);
    match result {
        Ok(()) => client.send_status_response(0, None, None),
        Err(err) => client.send_status_response(errno_code(&err), Some(&err.to_string()), None),
    }
}

fn copy_item(backup_root: &Path, src: &str, dst: &str) -> io::Result<()> {
    let from = sanitize_relpath(backup_root, src)?;
    let to = sanitize_relpath(backup_root, dst)?;
    copy_recursively(&from, &to)
}

fn copy_recursively(from: &Path, to: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(from)?;
    if meta.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to).map(|_| ())
    }
}

fn parse_process_message(message: &Mb2Message) -> Option<ProcessResult> {
    let body = message.arg_dictionary(0)?;
    let error_code = body
        .get("ErrorCode")
        .and_then(Value::as_unsigned_integer)
        .unwrap_or(0);
    let description = body
        .get("ErrorDescription")
        .and_then(Value::as_string)
        .unwrap_or_default()
        .to_string();
    Some(ProcessResult {
        error_code,
        description,
    })
}

/// Maps the final device-reported result onto the operation outcome.
fn final_status(result: Option<ProcessResult>) -> Result<(), BackupError> {
    match result {
        Some(result) if result.error_code == 0 => Ok(()),
        Some(result) => Err(BackupError::mb2(
            result.error_code as i64,
            result.description,
        )),
        None => Err(BackupError::mb2(
            -1,
            "device disconnected without reporting a result",
        )),
    }
}

#[cfg_attr(not(feature = "apple"), allow(dead_code))]
fn validate_backup_options(udid: &str, options: &BackupOptions) -> Result<(), BackupError> {
    if options.backup_dir.as_os_str().is_empty() {
        return Err(BackupError::IoError(
            "backup directory must not be empty".to_string(),
        ));
    }
    if options.encrypt {
        return Err(BackupError::Unsupported(
            "encrypted backups are not supported".to_string(),
        ));
    }
    if udid.trim().is_empty() {
        return Err(BackupError::ConnectionError(
            "UDID must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Shape of a successful probe: lockdownd's display values over the fixed
/// Apple/USB identity.
#[cfg_attr(not(feature = "apple"), allow(dead_code))]
fn probe_info(
    udid: &str,
    device_name: &str,
    product_type: &str,
    product_version: &str,
) -> DeviceInfo {
    DeviceInfo {
        device_type: DeviceType::Apple,
        uid: udid.to_string(),
        display_name: device_name.to_string(),
        manufacturer: "Apple".to_string(),
        model: product_type.to_string(),
        os_version: product_version.to_string(),
        transport: "USB".to_string(),
        online: true,
        ..DeviceInfo::default()
    }
}

/// Restore is reserved: it must exist as an operation and refuse without
/// touching the device or the filesystem.
pub fn perform_restore(_udid: &str, _options: &BackupOptions) -> Result<(), BackupError> {
    Err(BackupError::Unsupported(
        "restore is not implemented in this build".to_string(),
    ))
}

#[cfg(feature = "apple")]
mod live {
    use super::*;
    use tracing::info;

    use crate::app::apple::lockdown::{LockdownClient, LOCKDOWN_PORT};
    use crate::app::apple::tls::SecuredStream;
    use crate::app::apple::usbmux::{MuxConnection, MuxDevice};

    const BACKUP_SERVICE: &str = "com.apple.mobilebackup2";

    fn find_device(udid: &str) -> Result<(MuxConnection, MuxDevice), BackupError> {
        let mut mux = MuxConnection::connect()
            .map_err(|err| BackupError::ConnectionError(err.to_string()))?;
        let devices = mux
            .list_devices()
            .map_err(|err| BackupError::ConnectionError(err.to_string()))?;
        let device = devices
            .into_iter()
            .find(|d| d.udid == udid)
            .ok_or_else(|| BackupError::NoDevice(udid.to_string()))?;
        Ok((mux, device))
    }

    fn open_lockdown(
        mux: &mut MuxConnection,
        device: &MuxDevice,
    ) -> Result<LockdownClient, BackupError> {
        let pair_record = mux
            .read_pair_record(&device.udid)
            .map_err(|err| BackupError::ConnectionError(format!("pair record: {err}")))?;
        let service = MuxConnection::connect()
            .and_then(|conn| conn.connect_to_port(device.device_id, LOCKDOWN_PORT))
            .map_err(|err| BackupError::ConnectionError(err.to_string()))?;
        LockdownClient::handshake(service, CLIENT_LABEL, pair_record)
            .map_err(|err| BackupError::ConnectionError(err.to_string()))
    }

    /// Read-only probe: handshake and fetch the display metadata.
    pub fn test_connection(udid: &str) -> Result<DeviceInfo, BackupError> {
        if udid.trim().is_empty() {
            return Err(BackupError::ConnectionError(
                "UDID must not be empty".to_string(),
            ));
        }
        let (mut mux, device) = find_device(udid)?;
        let mut lockdown = open_lockdown(&mut mux, &device)?;

        let device_name = lockdown.get_string_value(None, "DeviceName").unwrap_or_default();
        let product_type = lockdown.get_string_value(None, "ProductType").unwrap_or_default();
        let product_version = lockdown
            .get_string_value(None, "ProductVersion")
            .unwrap_or_default();

        info!(udid = %udid, name = %device_name, product = %product_type, os = %product_version,
              "apple device probe succeeded");

        Ok(probe_info(udid, &device_name, &product_type, &product_version))
    }

    /// Full-device backup: validate, refuse encryption, start the service,
    /// exchange versions, send the Backup request and serve the message
    /// loop until the device disconnects.
    pub fn perform_backup(udid: &str, options: &BackupOptions) -> Result<(), BackupError> {
        validate_backup_options(udid, options)?;
        fs::create_dir_all(&options.backup_dir)
            .map_err(|err| BackupError::IoError(format!("create backup dir: {err}")))?;

        let (mut mux, device) = find_device(udid)?;
        let pair_record = mux
            .read_pair_record(udid)
            .map_err(|err| BackupError::ConnectionError(format!("pair record: {err}")))?;
        let mut lockdown = open_lockdown(&mut mux, &device)?;

        let will_encrypt = lockdown
            .get_value(Some("com.apple.mobile.backup"), "WillEncrypt")
            .ok()
            .flatten()
            .and_then(|v| v.as_boolean())
            .unwrap_or(false);
        if will_encrypt {
            return Err(BackupError::Unsupported(
                "device has backup encryption enabled".to_string(),
            ));
        }

        let service = lockdown
            .start_service(BACKUP_SERVICE)
            .map_err(|err| BackupError::ConnectionError(format!("start service: {err}")))?;
        drop(lockdown);

        let stream = MuxConnection::connect()
            .and_then(|conn| conn.connect_to_port(device.device_id, service.port))
            .map_err(|err| BackupError::ConnectionError(err.to_string()))?;
        let stream = if service.ssl {
            SecuredStream::secure(stream, &pair_record)
                .map_err(|err| BackupError::ConnectionError(format!("service tls: {err}")))?
        } else {
            SecuredStream::Plain(stream)
        };

        let mut client = Mb2Client::start(stream)
            .map_err(|err| BackupError::ConnectionError(format!("devicelink: {err}")))?;
        let version = client.version_exchange(&SUPPORTED_VERSIONS)?;
        info!(udid = %udid, version, dir = %options.backup_dir.display(), "backup starting");

        let mut request_options = Dictionary::new();
        if options.full_backup {
            request_options.insert("ForceFullBackup".to_string(), Value::Boolean(true));
        }
        client
            .send_request("Backup", udid, udid, Some(request_options))
            .map_err(|err| BackupError::ConnectionError(format!("backup request: {err}")))?;

        let result = run_message_loop(&mut client, &options.backup_dir)
            .map_err(|err| BackupError::ConnectionError(err.to_string()))?;
        let outcome = final_status(result);
        match &outcome {
            Ok(()) => info!(udid = %udid, "backup finished"),
            Err(err) => warn!(udid = %udid, error = %err, "backup failed"),
        }
        outcome
    }
}

#[cfg(feature = "apple")]
pub use live::{perform_backup, test_connection};

#[cfg(not(feature = "apple"))]
mod stub {
    use super::*;

    const MESSAGE: &str =
        "built without the apple feature; Apple device operations are unavailable";

    pub fn test_connection(_udid: &str) -> Result<DeviceInfo, BackupError> {
        Err(BackupError::Unsupported(MESSAGE.to_string()))
    }

    pub fn perform_backup(_udid: &str, options: &BackupOptions) -> Result<(), BackupError> {
        // Encryption is refused even before the capability complaint so the
        // caller gets the more specific answer.
        if options.encrypt {
            return Err(BackupError::Unsupported(
                "encrypted backups are not supported".to_string(),
            ));
        }
        Err(BackupError::Unsupported(MESSAGE.to_string()))
    }
}

#[cfg(not(feature = "apple"))]
pub use stub::{perform_backup, test_connection};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::apple::devicelink::DeviceLink;
    use std::io::Cursor;
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use tempfile::TempDir;

    // ---- scripted device peer over a loopback socket ----

    fn frame(value: &Value) -> Vec<u8> {
        let mut body = Vec::new();
        value.to_writer_binary(&mut body).expect("encode");
        let mut framed = (body.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);
        framed
    }

    fn dl_message(name: &str, args: Vec<Value>) -> Vec<u8> {
        let mut items = vec![Value::String(name.to_string())];
        items.extend(args);
        frame(&Value::Array(items))
    }

    fn read_status(stream: &mut TcpStream) -> (i64, String, Value) {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).expect("status len");
        let len = u32::from_be_bytes(len) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).expect("status body");
        let value = Value::from_reader(Cursor::new(body)).expect("status plist");
        let items = value.as_array().expect("array").clone();
        assert_eq!(items[0].as_string(), Some("DLMessageStatusResponse"));
        (
            items[1].as_signed_integer().expect("code"),
            items[2].as_string().unwrap_or_default().to_string(),
            items[3].clone(),
        )
    }

    fn filename(name: &str) -> Vec<u8> {
        let mut bytes = (name.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(name.as_bytes());
        bytes
    }

    fn data_block(code: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = ((payload.len() as u32) + 1).to_be_bytes().to_vec();
        bytes.push(code);
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Runs the message loop against a device script executed on a peer
    /// thread. The script gets the device-side socket.
    fn run_with_device<F>(root: &Path, script: F) -> Result<Option<ProcessResult>, WireError>
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let device = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            script(stream);
        });

        let host = TcpStream::connect(addr).expect("connect");
        let mut client = Mb2Client {
            link: DeviceLink::new(host),
        };
        let result = run_message_loop(&mut client, root);
        device.join().expect("device thread");
        result
    }

    #[test]
    fn upload_single_file_writes_bytes_and_acks() {
        let dir = TempDir::new().expect("tmp");
        let root = dir.path().to_path_buf();

        let result = run_with_device(&root, |mut stream| {
            stream
                .write_all(&dl_message("DLMessageUploadFiles", vec![]))
                .expect("message");
            stream.write_all(&filename("AppDomain")).expect("domain");
            stream.write_all(&filename("rel/a.bin")).expect("path");
            stream
                .write_all(&data_block(CODE_FILE_DATA, b"data"))
                .expect("block");
            stream.write_all(&0u32.to_be_bytes()).expect("file end");
            stream.write_all(&0u32.to_be_bytes()).expect("list end");

            let (code, _, _) = read_status(&mut stream);
            assert_eq!(code, 0);
            stream
                .write_all(&dl_message("DLMessageDisconnect", vec![]))
                .expect("disconnect");
        });

        assert!(result.expect("loop").is_none());
        let written = fs::read(dir.path().join("rel/a.bin")).expect("file");
        assert_eq!(written, b"data");
    }

    #[test]
    fn upload_zero_byte_file_creates_empty_file() {
        let dir = TempDir::new().expect("tmp");
        let root = dir.path().to_path_buf();

        run_with_device(&root, |mut stream| {
            stream
                .write_all(&dl_message("DLMessageUploadFiles", vec![]))
                .expect("message");
            stream.write_all(&filename("AppDomain")).expect("domain");
            stream.write_all(&filename("empty.bin")).expect("path");
            // nlen=1 block: a data code with no payload, then terminator.
            stream
                .write_all(&data_block(CODE_FILE_DATA, b""))
                .expect("block");
            stream.write_all(&0u32.to_be_bytes()).expect("file end");
            stream.write_all(&0u32.to_be_bytes()).expect("list end");

            let (code, _, _) = read_status(&mut stream);
            assert_eq!(code, 0);
            stream
                .write_all(&dl_message("DLMessageDisconnect", vec![]))
                .expect("disconnect");
        })
        .expect("loop");

        let meta = fs::metadata(dir.path().join("empty.bin")).expect("file");
        assert_eq!(meta.len(), 0);
    }

    #[test]
    fn oversized_filename_aborts_without_creating_files() {
        let dir = TempDir::new().expect("tmp");
        let root = dir.path().to_path_buf();

        let result = run_with_device(&root, |mut stream| {
            stream
                .write_all(&dl_message("DLMessageUploadFiles", vec![]))
                .expect("message");
            stream
                .write_all(&(5000u32).to_be_bytes())
                .expect("bogus length");
            // The host aborts; nothing else to script.
        });

        match result {
            Err(WireError::ProtocolFail(msg)) => assert!(msg.contains("filename length")),
            other => panic!("expected ProtocolFail, got {other:?}"),
        }
        assert_eq!(fs::read_dir(dir.path()).expect("dir").count(), 0);
    }

    #[test]
    fn upload_path_escaping_root_is_refused_but_stream_survives() {
        let dir = TempDir::new().expect("tmp");
        let root = dir.path().join("inner");
        fs::create_dir_all(&root).expect("mkdir");
        let root_clone = root.clone();

        run_with_device(&root_clone, |mut stream| {
            stream
                .write_all(&dl_message("DLMessageUploadFiles", vec![]))
                .expect("message");
            stream.write_all(&filename("AppDomain")).expect("domain");
            stream
                .write_all(&filename("../escape.bin"))
                .expect("path");
            stream
                .write_all(&data_block(CODE_FILE_DATA, b"data"))
                .expect("block");
            stream.write_all(&0u32.to_be_bytes()).expect("file end");
            stream.write_all(&0u32.to_be_bytes()).expect("list end");

            let (code, description, _) = read_status(&mut stream);
            assert_ne!(code, 0);
            assert!(!description.is_empty());
            stream
                .write_all(&dl_message("DLMessageDisconnect", vec![]))
                .expect("disconnect");
        })
        .expect("loop");

        assert!(!dir.path().join("escape.bin").exists());
    }

    #[test]
    fn directory_listing_reports_types_and_sizes() {
        let dir = TempDir::new().expect("tmp");
        fs::create_dir(dir.path().join("sub")).expect("mkdir");
        fs::write(dir.path().join("file.bin"), b"12345").expect("write");
        let root = dir.path().to_path_buf();

        run_with_device(&root, |mut stream| {
            stream
                .write_all(&dl_message(
                    "DLContentsOfDirectory",
                    vec![Value::String(".".to_string())],
                ))
                .expect("message");
            let (code, _, payload) = read_status(&mut stream);
            assert_eq!(code, 0);
            let listing = payload.as_dictionary().expect("dict");
            let file = listing
                .get("file.bin")
                .and_then(Value::as_dictionary)
                .expect("file entry");
            assert_eq!(
                file.get("DLFileType").and_then(Value::as_string),
                Some("DLFileTypeRegular")
            );
            assert_eq!(
                file.get("DLFileSize").and_then(Value::as_unsigned_integer),
                Some(5)
            );
            let sub = listing
                .get("sub")
                .and_then(Value::as_dictionary)
                .expect("dir entry");
            assert_eq!(
                sub.get("DLFileType").and_then(Value::as_string),
                Some("DLFileTypeDirectory")
            );
            stream
                .write_all(&dl_message("DLMessageDisconnect", vec![]))
                .expect("disconnect");
        })
        .expect("loop");
    }

    #[test]
    fn create_directory_is_recursive_and_idempotent() {
        let dir = TempDir::new().expect("tmp");
        let root = dir.path().to_path_buf();

        run_with_device(&root, |mut stream| {
            for _ in 0..2 {
                stream
                    .write_all(&dl_message(
                        "DLMessageCreateDirectory",
                        vec![Value::String("a/b/c".to_string())],
                    ))
                    .expect("message");
                let (code, _, _) = read_status(&mut stream);
                assert_eq!(code, 0, "EEXIST must not be an error");
            }
            stream
                .write_all(&dl_message("DLMessageDisconnect", vec![]))
                .expect("disconnect");
        })
        .expect("loop");

        assert!(dir.path().join("a/b/c").is_dir());
    }

    #[test]
    fn move_files_replaces_destination() {
        let dir = TempDir::new().expect("tmp");
        fs::write(dir.path().join("src.txt"), b"new").expect("write src");
        fs::write(dir.path().join("dst.txt"), b"old").expect("write dst");
        let root = dir.path().to_path_buf();

        run_with_device(&root, |mut stream| {
            let mut moves = Dictionary::new();
            moves.insert(
                "src.txt".to_string(),
                Value::String("dst.txt".to_string()),
            );
            stream
                .write_all(&dl_message(
                    "DLMessageMoveFiles",
                    vec![Value::Dictionary(moves)],
                ))
                .expect("message");
            let (code, _, _) = read_status(&mut stream);
            assert_eq!(code, 0);
            stream
                .write_all(&dl_message("DLMessageDisconnect", vec![]))
                .expect("disconnect");
        })
        .expect("loop");

        assert!(!dir.path().join("src.txt").exists());
        assert_eq!(fs::read(dir.path().join("dst.txt")).expect("dst"), b"new");
    }

    #[test]
    fn remove_items_is_best_effort_with_last_error() {
        let dir = TempDir::new().expect("tmp");
        fs::write(dir.path().join("present.txt"), b"x").expect("write");
        let root = dir.path().to_path_buf();

        run_with_device(&root, |mut stream| {
            stream
                .write_all(&dl_message(
                    "DLMessageRemoveFiles",
                    vec![Value::Array(vec![
                        Value::String("present.txt".to_string()),
                        Value::String("missing.txt".to_string()),
                    ])],
                ))
                .expect("message");
            let (code, _, _) = read_status(&mut stream);
            assert_eq!(code, -6, "missing file maps to ENOENT sentinel");
            stream
                .write_all(&dl_message("DLMessageDisconnect", vec![]))
                .expect("disconnect");
        })
        .expect("loop");

        assert!(!dir.path().join("present.txt").exists());
    }

    #[test]
    fn copy_item_copies_trees() {
        let dir = TempDir::new().expect("tmp");
        fs::create_dir_all(dir.path().join("tree/nested")).expect("mkdir");
        fs::write(dir.path().join("tree/nested/f.txt"), b"payload").expect("write");
        let root = dir.path().to_path_buf();

        run_with_device(&root, |mut stream| {
            stream
                .write_all(&dl_message(
                    "DLMessageCopyItem",
                    vec![
                        Value::String("tree".to_string()),
                        Value::String("copy".to_string()),
                    ],
                ))
                .expect("message");
            let (code, _, _) = read_status(&mut stream);
            assert_eq!(code, 0);
            stream
                .write_all(&dl_message("DLMessageDisconnect", vec![]))
                .expect("disconnect");
        })
        .expect("loop");

        assert_eq!(
            fs::read(dir.path().join("copy/nested/f.txt")).expect("copied"),
            b"payload"
        );
    }

    #[test]
    fn free_disk_space_reports_a_number() {
        let dir = TempDir::new().expect("tmp");
        let root = dir.path().to_path_buf();

        run_with_device(&root, |mut stream| {
            stream
                .write_all(&dl_message("DLMessageGetFreeDiskSpace", vec![]))
                .expect("message");
            let (code, _, payload) = read_status(&mut stream);
            assert_eq!(code, 0);
            assert!(payload.as_unsigned_integer().is_some());
            stream
                .write_all(&dl_message("DLMessageDisconnect", vec![]))
                .expect("disconnect");
        })
        .expect("loop");
    }

    #[test]
    fn process_message_result_is_captured() {
        let dir = TempDir::new().expect("tmp");
        let root = dir.path().to_path_buf();

        let result = run_with_device(&root, |mut stream| {
            let mut body = Dictionary::new();
            body.insert("ErrorCode".to_string(), Value::Integer(207u64.into()));
            body.insert(
                "ErrorDescription".to_string(),
                Value::String("Backup cancelled".to_string()),
            );
            stream
                .write_all(&dl_message(
                    "DLMessageProcessMessage",
                    vec![Value::Dictionary(body)],
                ))
                .expect("message");
            stream
                .write_all(&dl_message("DLMessageDisconnect", vec![]))
                .expect("disconnect");
        })
        .expect("loop");

        let result = result.expect("process result");
        assert_eq!(result.error_code, 207);
        assert_eq!(result.description, "Backup cancelled");

        match final_status(Some(result)) {
            Err(BackupError::Mobilebackup2Error { code, message }) => {
                assert_eq!(code, 207);
                assert_eq!(message, "Backup cancelled");
            }
            other => panic!("expected Mobilebackup2Error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_messages_are_skipped() {
        let dir = TempDir::new().expect("tmp");
        let root = dir.path().to_path_buf();

        let result = run_with_device(&root, |mut stream| {
            stream
                .write_all(&dl_message("DLMessagePurgeDiskSpace", vec![]))
                .expect("message");
            stream
                .write_all(&dl_message("DLMessageDisconnect", vec![]))
                .expect("disconnect");
        });

        assert!(result.expect("loop").is_none());
    }

    // ---- unit-level pieces ----

    #[test]
    fn sanitize_collapses_dot_segments() {
        let root = Path::new("/backups/udid");
        assert_eq!(
            sanitize_relpath(root, "a/./b/../c.txt").expect("ok"),
            Path::new("/backups/udid/a/c.txt")
        );
    }

    #[test]
    fn sanitize_refuses_escape_and_absolute() {
        let root = Path::new("/backups/udid");
        assert!(sanitize_relpath(root, "../outside").is_err());
        assert!(sanitize_relpath(root, "a/../../outside").is_err());
        assert!(sanitize_relpath(root, "/etc/passwd").is_err());
    }

    #[test]
    fn errno_mapping_follows_protocol_sentinels() {
        assert_eq!(errno_code(&io::Error::from(io::ErrorKind::NotFound)), -6);
        assert_eq!(
            errno_code(&io::Error::from(io::ErrorKind::AlreadyExists)),
            -7
        );
        assert_eq!(
            errno_code(&io::Error::from(io::ErrorKind::NotADirectory)),
            -8
        );
        assert_eq!(errno_code(&io::Error::from(io::ErrorKind::IsADirectory)), -9);
        assert_eq!(errno_code(&io::Error::from(io::ErrorKind::StorageFull)), -15);
        assert_eq!(errno_code(&io::Error::other("misc")), -1);
    }

    #[test]
    fn final_status_requires_a_result() {
        assert!(final_status(Some(ProcessResult {
            error_code: 0,
            description: String::new(),
        }))
        .is_ok());
        assert!(matches!(
            final_status(None),
            Err(BackupError::Mobilebackup2Error { .. })
        ));
    }

    #[test]
    fn probe_fills_the_apple_identity_fields() {
        let info = probe_info("udid-ada", "Ada's iPhone", "iPhone15,3", "17.4.1");
        assert_eq!(info.device_type, DeviceType::Apple);
        assert_eq!(info.uid, "udid-ada");
        assert_eq!(info.display_name, "Ada's iPhone");
        assert_eq!(info.model, "iPhone15,3");
        assert_eq!(info.os_version, "17.4.1");
        assert_eq!(info.manufacturer, "Apple");
        assert_eq!(info.transport, "USB");
        assert!(info.online);
    }

    #[test]
    fn restore_is_reserved_and_refuses() {
        let err = perform_restore("udid", &BackupOptions::new("/tmp/x")).unwrap_err();
        assert!(matches!(err, BackupError::Unsupported(_)));
    }

    #[test]
    fn encrypted_backup_is_refused_before_any_io() {
        let mut options = BackupOptions::new("/nonexistent/backup/root");
        options.encrypt = true;
        let err = perform_backup("some-udid", &options).unwrap_err();
        assert!(matches!(err, BackupError::Unsupported(_)));
        assert!(!Path::new("/nonexistent/backup/root").exists());
    }

    #[cfg(feature = "apple")]
    #[test]
    fn empty_backup_dir_is_an_io_error() {
        let options = BackupOptions::new("");
        let err = perform_backup("some-udid", &options).unwrap_err();
        assert!(matches!(err, BackupError::IoError(_)));
    }

    #[test]
    fn validation_order_prefers_specific_answers() {
        // Empty dir wins over encryption, encryption wins over empty UDID.
        let mut options = BackupOptions::new("");
        options.encrypt = true;
        assert!(matches!(
            validate_backup_options("", &options),
            Err(BackupError::IoError(_))
        ));
        let mut options = BackupOptions::new("/tmp/b");
        options.encrypt = true;
        assert!(matches!(
            validate_backup_options("", &options),
            Err(BackupError::Unsupported(_))
        ));
        let options = BackupOptions::new("/tmp/b");
        assert!(matches!(
            validate_backup_options("", &options),
            Err(BackupError::ConnectionError(_))
        ));
    }
}
