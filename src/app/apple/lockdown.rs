use std::io::{Cursor, Read, Write};

use plist::{Dictionary, Value};
use tracing::debug;

use crate::app::apple::tls::SecuredStream;
use crate::app::apple::usbmux::{MuxSocket, PairRecord};
use crate::app::error::WireError;

pub const LOCKDOWN_PORT: u16 = 62078;

const MAX_MESSAGE_LEN: u32 = 16 * 1024 * 1024;

/// Service endpoint returned by `StartService`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub port: u16,
    pub ssl: bool,
}

/// lockdownd speaks u32-BE length-prefixed XML property lists. After
/// `StartSession` the device may require the channel to move onto TLS with
/// the host identity from the pair record.
pub struct LockdownClient<S: Read + Write = MuxSocket> {
    stream: Option<SecuredStream<S>>,
    label: String,
}

impl<S: Read + Write> LockdownClient<S> {
    /// The handshake the rest of the driver relies on: QueryType must name
    /// lockdownd, then StartSession with the pairing identity (upgrading to
    /// TLS when the device asks for it).
    pub fn handshake(socket: S, label: &str, pair: PairRecord) -> Result<Self, WireError> {
        let mut client = Self {
            stream: Some(SecuredStream::Plain(socket)),
            label: label.to_string(),
        };
        let query_type = client.query_type()?;
        if query_type != "com.apple.mobile.lockdown" {
            return Err(WireError::ProtocolFail(format!(
                "unexpected lockdown type {query_type}"
            )));
        }
        client.start_session(&pair)?;
        Ok(client)
    }

    pub fn query_type(&mut self) -> Result<String, WireError> {
        let reply = self.round_trip(self.base_request("QueryType"))?;
        Ok(reply
            .get("Type")
            .and_then(Value::as_string)
            .unwrap_or_default()
            .to_string())
    }

    pub fn start_session(&mut self, pair: &PairRecord) -> Result<(), WireError> {
        let mut body = self.base_request("StartSession");
        body.insert(
            "HostID".to_string(),
            Value::String(pair.host_id.clone()),
        );
        body.insert(
            "SystemBUID".to_string(),
            Value::String(pair.system_buid.clone()),
        );
        let reply = self.round_trip(body)?;
        check_error(&reply)?;

        let enable_ssl = reply
            .get("EnableSessionSSL")
            .and_then(Value::as_boolean)
            .unwrap_or(false);
        if enable_ssl {
            let stream = self
                .stream
                .take()
                .ok_or_else(|| WireError::invalid("lockdown stream already taken"))?;
            self.stream = Some(match stream {
                SecuredStream::Plain(socket) => SecuredStream::secure(socket, pair)?,
                secured @ SecuredStream::Tls(_) => secured,
            });
            debug!("lockdown session upgraded to TLS");
        }
        Ok(())
    }

    /// Fetches one value; `None` when the device has nothing under the key.
    pub fn get_value(
        &mut self,
        domain: Option<&str>,
        key: &str,
    ) -> Result<Option<Value>, WireError> {
        let mut body = self.base_request("GetValue");
        if let Some(domain) = domain {
            body.insert("Domain".to_string(), Value::String(domain.to_string()));
        }
        body.insert("Key".to_string(), Value::String(key.to_string()));
        let mut reply = self.round_trip(body)?;
        check_error(&reply)?;
        Ok(reply.remove("Value"))
    }

    /// String-typed convenience used for the probe fields; non-string and
    /// missing values come back empty.
    pub fn get_string_value(&mut self, domain: Option<&str>, key: &str) -> Result<String, WireError> {
        Ok(self
            .get_value(domain, key)?
            .and_then(|value| value.as_string().map(str::to_string))
            .unwrap_or_default())
    }

    pub fn start_service(&mut self, name: &str) -> Result<ServiceDescriptor, WireError> {
        let mut body = self.base_request("StartService");
        body.insert("Service".to_string(), Value::String(name.to_string()));
        let reply = self.round_trip(body)?;
        check_error(&reply)?;

        let port = reply
            .get("Port")
            .and_then(Value::as_unsigned_integer)
            .ok_or_else(|| WireError::ProtocolFail(format!("no port for service {name}")))?;
        let ssl = reply
            .get("EnableServiceSSL")
            .and_then(Value::as_boolean)
            .unwrap_or(false);
        Ok(ServiceDescriptor {
            port: port as u16,
            ssl,
        })
    }

    fn base_request(&self, request: &str) -> Dictionary {
        let mut body = Dictionary::new();
        body.insert("Label".to_string(), Value::String(self.label.clone()));
        body.insert(
            "Request".to_string(),
            Value::String(request.to_string()),
        );
        body
    }

    fn round_trip(&mut self, body: Dictionary) -> Result<Dictionary, WireError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| WireError::invalid("lockdown stream already taken"))?;

        let mut payload = Vec::new();
        Value::Dictionary(body).to_writer_xml(&mut payload)?;
        let len = payload.len() as u32;
        stream.write_all(&len.to_be_bytes())?;
        stream.write_all(&payload)?;
        stream.flush()?;

        let mut header = [0u8; 4];
        read_exact(stream, &mut header)?;
        let len = u32::from_be_bytes(header);
        if len == 0 || len > MAX_MESSAGE_LEN {
            return Err(WireError::invalid(format!(
                "implausible lockdown message length {len}"
            )));
        }
        let mut reply = vec![0u8; len as usize];
        read_exact(stream, &mut reply)?;
        Value::from_reader(Cursor::new(reply))?
            .into_dictionary()
            .ok_or_else(|| WireError::invalid("lockdown reply is not a dictionary"))
    }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
    let wanted = buf.len();
    let mut filled = 0usize;
    while filled < wanted {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(WireError::ShortRead {
                    wanted,
                    got: filled,
                })
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(WireError::Io(err)),
        }
    }
    Ok(())
}

fn check_error(reply: &Dictionary) -> Result<(), WireError> {
    match reply.get("Error").and_then(Value::as_string) {
        None => Ok(()),
        Some(error) => Err(WireError::ProtocolFail(format!("lockdownd: {error}"))),
    }
}
