use std::io::{Read, Write};

use plist::{Dictionary, Value};
use tracing::debug;

use crate::app::apple::devicelink::{split_message, DeviceLink};
use crate::app::error::{BackupError, WireError};

/// Protocol versions we can speak, in preference order.
pub const SUPPORTED_VERSIONS: [f64; 3] = [2.0, 2.1, 1.0];

/// One inbound service message: the `DLMessage*` name plus its arguments
/// (everything after the name in the frame array).
#[derive(Debug)]
pub struct Mb2Message {
    pub name: String,
    pub args: Vec<Value>,
}

impl Mb2Message {
    pub fn arg_string(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Value::as_string)
    }

    pub fn arg_dictionary(&self, index: usize) -> Option<&Dictionary> {
        self.args.get(index).and_then(Value::as_dictionary)
    }

    pub fn arg_array(&self, index: usize) -> Option<&Vec<Value>> {
        self.args.get(index).and_then(Value::as_array)
    }
}

/// mobilebackup2 session riding on a DeviceLink channel.
pub struct Mb2Client<S: Read + Write> {
    pub link: DeviceLink<S>,
}

impl<S: Read + Write> Mb2Client<S> {
    /// Runs the DeviceLink handshake; service messages can flow afterwards.
    pub fn start(stream: S) -> Result<Self, WireError> {
        let mut link = DeviceLink::new(stream);
        link.version_exchange()?;
        Ok(Self { link })
    }

    /// `Hello` / `Response` exchange. Returns the protocol version the
    /// device settled on.
    pub fn version_exchange(&mut self, versions: &[f64]) -> Result<f64, BackupError> {
        let mut hello = Dictionary::new();
        hello.insert("MessageName".to_string(), Value::String("Hello".to_string()));
        hello.insert(
            "SupportedProtocolVersions".to_string(),
            Value::Array(versions.iter().map(|v| Value::Real(*v)).collect()),
        );
        self.link.send_process_message(hello)?;

        let reply = self.receive_message()?;
        if reply.name != "DLMessageProcessMessage" {
            return Err(BackupError::mb2(
                -1,
                format!("unexpected reply to Hello: {}", reply.name),
            ));
        }
        let body = reply
            .arg_dictionary(0)
            .ok_or_else(|| BackupError::mb2(-1, "Hello reply carries no dictionary"))?;
        let error_code = body
            .get("ErrorCode")
            .and_then(Value::as_unsigned_integer)
            .unwrap_or(u64::MAX);
        if error_code != 0 {
            return Err(BackupError::mb2(
                error_code as i64,
                "version exchange refused by device",
            ));
        }
        let version = body
            .get("ProtocolVersion")
            .and_then(|v| v.as_real().or_else(|| v.as_string()?.parse().ok()))
            .unwrap_or(0.0);
        debug!(version, "mobilebackup2 version exchange complete");
        Ok(version)
    }

    /// Sends a top-level request (`Backup`, `Restore`, ...) addressed by
    /// target and source identifiers.
    pub fn send_request(
        &mut self,
        request: &str,
        target_identifier: &str,
        source_identifier: &str,
        options: Option<Dictionary>,
    ) -> Result<(), WireError> {
        let mut body = Dictionary::new();
        body.insert(
            "MessageName".to_string(),
            Value::String(request.to_string()),
        );
        body.insert(
            "TargetIdentifier".to_string(),
            Value::String(target_identifier.to_string()),
        );
        body.insert(
            "SourceIdentifier".to_string(),
            Value::String(source_identifier.to_string()),
        );
        if let Some(options) = options {
            body.insert("Options".to_string(), Value::Dictionary(options));
        }
        self.link.send_process_message(body)
    }

    pub fn receive_message(&mut self) -> Result<Mb2Message, WireError> {
        let frame = self.link.receive_plist()?;
        let (name, args) = split_message(&frame)?;
        Ok(Mb2Message {
            name: name.to_string(),
            args: args.to_vec(),
        })
    }

    pub fn send_status_response(
        &mut self,
        code: i64,
        status: Option<&str>,
        payload: Option<Value>,
    ) -> Result<(), WireError> {
        self.link.send_status_response(code, status, payload)
    }
}
