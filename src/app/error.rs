use std::io;

use thiserror::Error;

/// Failures on the byte-framed protocols (ADB smart socket, usbmuxd,
/// DeviceLink). Transient I/O stays `io::Error` based so callers can keep
/// reconnect decisions separate from protocol-level refusal.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    #[error("peer reported failure: {0}")]
    ProtocolFail(String),

    #[error("unexpected response {0:?}")]
    UnexpectedResponse([u8; 4]),

    #[error("plist: {0}")]
    Plist(#[from] plist::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WireError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        WireError::InvalidFrame(msg.into())
    }
}

/// Outcome taxonomy for the Apple backup driver. One variant per way a
/// single-shot backup operation can end.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("no device with UDID {0}")]
    NoDevice(String),

    #[error("connection failed: {0}")]
    ConnectionError(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("mobilebackup2 error {code}: {message}")]
    Mobilebackup2Error { code: i64, message: String },
}

impl BackupError {
    pub fn mb2(code: i64, message: impl Into<String>) -> Self {
        BackupError::Mobilebackup2Error {
            code,
            message: message.into(),
        }
    }
}

impl From<io::Error> for BackupError {
    fn from(err: io::Error) -> Self {
        BackupError::IoError(err.to_string())
    }
}

impl From<WireError> for BackupError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::ProtocolFail(msg) => BackupError::ConnectionError(msg),
            other => BackupError::ConnectionError(other.to_string()),
        }
    }
}
