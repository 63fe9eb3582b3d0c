use std::io::{Cursor, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::PathBuf;

use plist::{Dictionary, Value};
use tracing::debug;

use crate::app::error::WireError;

/// usbmuxd packet header: four little-endian u32s (total length including
/// the header, protocol version, message type, tag). Payloads are XML
/// property lists.
const HEADER_LEN: u32 = 16;
const PLIST_VERSION: u32 = 1;
const MSG_PLIST: u32 = 8;
const MAX_PACKET_LEN: u32 = 16 * 1024 * 1024;

pub const CLIENT_VERSION: &str = "devicewatcher";

#[cfg(unix)]
const DEFAULT_UNIX_PATH: &str = "/var/run/usbmuxd";
#[cfg(not(unix))]
const DEFAULT_TCP_ADDR: &str = "127.0.0.1:27015";

/// Where to find usbmuxd. `USBMUXD_SOCKET_ADDRESS` accepts `UNIX:/path` or
/// `host:port`; the platform default applies otherwise.
#[derive(Debug, Clone)]
pub enum MuxAddr {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(String),
}

impl MuxAddr {
    pub fn from_env() -> Self {
        if let Ok(spec) = std::env::var("USBMUXD_SOCKET_ADDRESS") {
            let spec = spec.trim().to_string();
            #[cfg(unix)]
            if let Some(path) = spec.strip_prefix("UNIX:") {
                return MuxAddr::Unix(PathBuf::from(path));
            }
            if !spec.is_empty() {
                return MuxAddr::Tcp(spec);
            }
        }
        Self::platform_default()
    }

    #[cfg(unix)]
    fn platform_default() -> Self {
        MuxAddr::Unix(PathBuf::from(DEFAULT_UNIX_PATH))
    }

    #[cfg(not(unix))]
    fn platform_default() -> Self {
        MuxAddr::Tcp(DEFAULT_TCP_ADDR.to_string())
    }
}

/// The connected socket, unix or TCP. After a successful `Connect` request
/// the same socket turns into a raw pipe to the device port.
#[derive(Debug)]
pub enum MuxSocket {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl MuxSocket {
    pub fn try_clone(&self) -> std::io::Result<MuxSocket> {
        match self {
            #[cfg(unix)]
            MuxSocket::Unix(s) => s.try_clone().map(MuxSocket::Unix),
            MuxSocket::Tcp(s) => s.try_clone().map(MuxSocket::Tcp),
        }
    }

    pub fn shutdown(&self) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            MuxSocket::Unix(s) => s.shutdown(Shutdown::Both),
            MuxSocket::Tcp(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for MuxSocket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            MuxSocket::Unix(s) => s.read(buf),
            MuxSocket::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for MuxSocket {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            MuxSocket::Unix(s) => s.write(buf),
            MuxSocket::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            MuxSocket::Unix(s) => s.flush(),
            MuxSocket::Tcp(s) => s.flush(),
        }
    }
}

/// One attached device as usbmuxd reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxDevice {
    pub device_id: u64,
    pub udid: String,
    pub connection_type: String,
    pub product_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    Attached(MuxDevice),
    Detached { device_id: u64 },
    /// Anything we do not act on (Paired and friends).
    Other(String),
}

/// Host pairing record as stored by usbmuxd. Certificates and keys are PEM
/// blobs.
#[derive(Debug, Clone)]
pub struct PairRecord {
    pub host_id: String,
    pub system_buid: String,
    pub host_certificate: Vec<u8>,
    pub host_private_key: Vec<u8>,
    pub root_certificate: Vec<u8>,
}

impl PairRecord {
    pub fn from_dictionary(dict: &Dictionary) -> Result<Self, WireError> {
        let string = |key: &str| -> String {
            dict.get(key)
                .and_then(Value::as_string)
                .unwrap_or_default()
                .to_string()
        };
        let data = |key: &str| -> Vec<u8> {
            dict.get(key)
                .and_then(Value::as_data)
                .map(<[u8]>::to_vec)
                .unwrap_or_default()
        };
        let record = Self {
            host_id: string("HostID"),
            system_buid: string("SystemBUID"),
            host_certificate: data("HostCertificate"),
            host_private_key: data("HostPrivateKey"),
            root_certificate: data("RootCertificate"),
        };
        if record.host_id.is_empty() {
            return Err(WireError::invalid("pair record has no HostID"));
        }
        Ok(record)
    }
}

/// A request/response connection to usbmuxd. `Listen` switches it into a
/// streaming mode; `Connect` consumes it and yields the raw device pipe.
pub struct MuxConnection {
    socket: MuxSocket,
    tag: u32,
}

impl MuxConnection {
    pub fn connect() -> Result<Self, WireError> {
        Self::connect_addr(&MuxAddr::from_env())
    }

    pub fn connect_addr(addr: &MuxAddr) -> Result<Self, WireError> {
        let socket = match addr {
            #[cfg(unix)]
            MuxAddr::Unix(path) => MuxSocket::Unix(UnixStream::connect(path)?),
            MuxAddr::Tcp(endpoint) => MuxSocket::Tcp(TcpStream::connect(endpoint.as_str())?),
        };
        Ok(Self { socket, tag: 0 })
    }

    /// Socket handle for out-of-band shutdown while another thread blocks
    /// in a read.
    pub fn socket_handle(&self) -> std::io::Result<MuxSocket> {
        self.socket.try_clone()
    }

    pub fn list_devices(&mut self) -> Result<Vec<MuxDevice>, WireError> {
        let reply = self.request(self.base_request("ListDevices"))?;
        let mut devices = Vec::new();
        if let Some(list) = reply.get("DeviceList").and_then(Value::as_array) {
            for entry in list {
                if let Some(dict) = entry.as_dictionary() {
                    if let Some(device) = parse_attached(dict) {
                        devices.push(device);
                    }
                }
            }
        }
        Ok(devices)
    }

    pub fn read_pair_record(&mut self, udid: &str) -> Result<PairRecord, WireError> {
        let mut body = self.base_request("ReadPairRecord");
        body.insert(
            "PairRecordID".to_string(),
            Value::String(udid.to_string()),
        );
        let reply = self.request(body)?;
        let data = reply
            .get("PairRecordData")
            .and_then(Value::as_data)
            .ok_or_else(|| WireError::ProtocolFail(format!("no pair record for {udid}")))?;
        let record = Value::from_reader(Cursor::new(data.to_vec()))?;
        let dict = record
            .as_dictionary()
            .ok_or_else(|| WireError::invalid("pair record is not a dictionary"))?;
        PairRecord::from_dictionary(dict)
    }

    /// Subscribes to attach/detach notifications. Call `next_event` in a
    /// loop afterwards; no other request may be issued on this connection.
    pub fn listen(&mut self) -> Result<(), WireError> {
        let reply = self.request(self.base_request("Listen"))?;
        check_result(&reply)
    }

    pub fn next_event(&mut self) -> Result<MuxEvent, WireError> {
        let packet = self.read_packet()?;
        let message_type = packet
            .get("MessageType")
            .and_then(Value::as_string)
            .unwrap_or_default();
        match message_type {
            "Attached" => {
                let device = packet
                    .get("Properties")
                    .and_then(Value::as_dictionary)
                    .and_then(parse_attached)
                    .ok_or_else(|| WireError::invalid("Attached without properties"))?;
                Ok(MuxEvent::Attached(device))
            }
            "Detached" => {
                let device_id = packet
                    .get("DeviceID")
                    .and_then(Value::as_unsigned_integer)
                    .ok_or_else(|| WireError::invalid("Detached without DeviceID"))?;
                Ok(MuxEvent::Detached { device_id })
            }
            other => Ok(MuxEvent::Other(other.to_string())),
        }
    }

    /// Tunnels to a TCP port on the device. On success the connection
    /// becomes the raw byte pipe and is returned to the caller.
    pub fn connect_to_port(mut self, device_id: u64, port: u16) -> Result<MuxSocket, WireError> {
        let mut body = self.base_request("Connect");
        body.insert("DeviceID".to_string(), Value::Integer(device_id.into()));
        // The port travels in network byte order.
        body.insert(
            "PortNumber".to_string(),
            Value::Integer(u64::from(port.swap_bytes()).into()),
        );
        let reply = self.request(body)?;
        check_result(&reply)?;
        debug!(device_id, port, "usbmux tunnel established");
        Ok(self.socket)
    }

    fn base_request(&self, message_type: &str) -> Dictionary {
        let mut body = Dictionary::new();
        body.insert(
            "MessageType".to_string(),
            Value::String(message_type.to_string()),
        );
        body.insert(
            "ClientVersionString".to_string(),
            Value::String(CLIENT_VERSION.to_string()),
        );
        body.insert(
            "ProgName".to_string(),
            Value::String(CLIENT_VERSION.to_string()),
        );
        body.insert("kLibUSBMuxVersion".to_string(), Value::Integer(3u64.into()));
        body
    }

    fn request(&mut self, body: Dictionary) -> Result<Dictionary, WireError> {
        self.send_packet(body)?;
        self.read_packet()
    }

    fn send_packet(&mut self, body: Dictionary) -> Result<(), WireError> {
        let mut payload = Vec::new();
        Value::Dictionary(body).to_writer_xml(&mut payload)?;
        self.tag += 1;

        let total = HEADER_LEN + payload.len() as u32;
        let mut packet = Vec::with_capacity(total as usize);
        packet.extend_from_slice(&total.to_le_bytes());
        packet.extend_from_slice(&PLIST_VERSION.to_le_bytes());
        packet.extend_from_slice(&MSG_PLIST.to_le_bytes());
        packet.extend_from_slice(&self.tag.to_le_bytes());
        packet.extend_from_slice(&payload);
        self.socket.write_all(&packet)?;
        self.socket.flush()?;
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Dictionary, WireError> {
        let mut header = [0u8; HEADER_LEN as usize];
        read_exact(&mut self.socket, &mut header)?;
        let total = u32::from_le_bytes(header[0..4].try_into().expect("header slice"));
        if total < HEADER_LEN || total > MAX_PACKET_LEN {
            return Err(WireError::invalid(format!("bad usbmux packet length {total}")));
        }
        let mut payload = vec![0u8; (total - HEADER_LEN) as usize];
        read_exact(&mut self.socket, &mut payload)?;
        let value = Value::from_reader(Cursor::new(payload))?;
        value
            .into_dictionary()
            .ok_or_else(|| WireError::invalid("usbmux payload is not a dictionary"))
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

fn check_result(reply: &Dictionary) -> Result<(), WireError> {
    let number = reply
        .get("Number")
        .and_then(Value::as_unsigned_integer)
        .unwrap_or(u64::MAX);
    if number == 0 {
        Ok(())
    } else {
        Err(WireError::ProtocolFail(format!(
            "usbmuxd refused the request (code {number})"
        )))
    }
}

fn parse_attached(properties: &Dictionary) -> Option<MuxDevice> {
    let udid = properties
        .get("SerialNumber")
        .and_then(Value::as_string)?
        .to_string();
    let device_id = properties
        .get("DeviceID")
        .and_then(Value::as_unsigned_integer)?;
    let connection_type = properties
        .get("ConnectionType")
        .and_then(Value::as_string)
        .unwrap_or("USB")
        .to_string();
    let product_id = properties
        .get("ProductID")
        .and_then(Value::as_unsigned_integer)
        .unwrap_or(0) as u16;
    Some(MuxDevice {
        device_id,
        udid,
        connection_type,
        product_id,
    })
}
