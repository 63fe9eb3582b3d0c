use std::io::{Cursor, Read, Write};

use plist::{Dictionary, Value};

use crate::app::error::WireError;

/// Placeholder the protocol uses for an absent status string.
pub const EMPTY_PARAMETER: &str = "___EmptyParameterString___";

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// DeviceLink channel: big-endian u32 length frames carrying property
/// lists, interleaved with raw byte runs during file transfer. The device
/// opens with a version exchange before any service traffic flows.
pub struct DeviceLink<S: Read + Write> {
    stream: S,
}

impl<S: Read + Write> DeviceLink<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Device side speaks first: `[DLMessageVersionExchange, major, minor]`.
    /// We answer `DLVersionsOk` and wait for `DLMessageDeviceReady`.
    pub fn version_exchange(&mut self) -> Result<(), WireError> {
        let opening = self.receive_plist()?;
        let (name, args) = split_message(&opening)?;
        if name != "DLMessageVersionExchange" {
            return Err(WireError::invalid(format!(
                "expected DLMessageVersionExchange, got {name}"
            )));
        }
        let major = args
            .first()
            .and_then(Value::as_unsigned_integer)
            .unwrap_or(300);

        let reply = Value::Array(vec![
            Value::String("DLMessageVersionExchange".to_string()),
            Value::String("DLVersionsOk".to_string()),
            Value::Integer(major.into()),
        ]);
        self.send_plist(&reply)?;

        let ready = self.receive_plist()?;
        let (name, _) = split_message(&ready)?;
        if name != "DLMessageDeviceReady" {
            return Err(WireError::invalid(format!(
                "expected DLMessageDeviceReady, got {name}"
            )));
        }
        Ok(())
    }

    /// `[DLMessageProcessMessage, dict]`, the envelope both sides use for
    /// service-level requests and replies.
    pub fn send_process_message(&mut self, body: Dictionary) -> Result<(), WireError> {
        let frame = Value::Array(vec![
            Value::String("DLMessageProcessMessage".to_string()),
            Value::Dictionary(body),
        ]);
        self.send_plist(&frame)
    }

    /// `[DLMessageStatusResponse, code, status, payload]`.
    pub fn send_status_response(
        &mut self,
        code: i64,
        status: Option<&str>,
        payload: Option<Value>,
    ) -> Result<(), WireError> {
        let frame = Value::Array(vec![
            Value::String("DLMessageStatusResponse".to_string()),
            Value::Integer(code.into()),
            Value::String(status.unwrap_or(EMPTY_PARAMETER).to_string()),
            payload.unwrap_or_else(|| Value::Dictionary(Dictionary::new())),
        ]);
        self.send_plist(&frame)
    }

    pub fn send_plist(&mut self, value: &Value) -> Result<(), WireError> {
        let mut body = Vec::new();
        value.to_writer_binary(&mut body)?;
        let len = u32::try_from(body.len())
            .map_err(|_| WireError::invalid("plist frame too large"))?;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(&body)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn receive_plist(&mut self) -> Result<Value, WireError> {
        let len = self.read_raw_u32()?;
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(WireError::invalid(format!("implausible frame length {len}")));
        }
        let mut body = vec![0u8; len as usize];
        self.read_raw_exact(&mut body)?;
        Ok(Value::from_reader(Cursor::new(body))?)
    }

    pub fn read_raw_u32(&mut self) -> Result<u32, WireError> {
        let mut buf = [0u8; 4];
        self.read_raw_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_raw_u8(&mut self) -> Result<u8, WireError> {
        let mut buf = [0u8; 1];
        self.read_raw_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Exact read that loops when the transport momentarily has nothing.
    pub fn read_raw_exact(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        let wanted = buf.len();
        let mut filled = 0usize;
        while filled < wanted {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(WireError::ShortRead {
                        wanted,
                        got: filled,
                    })
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(WireError::Io(err)),
            }
        }
        Ok(())
    }

    /// Streams `len` raw bytes into `sink` in bounded chunks.
    pub fn copy_raw_to<W: Write>(&mut self, len: u64, sink: &mut W) -> Result<(), WireError> {
        let mut remaining = len;
        let mut chunk = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let take = remaining.min(chunk.len() as u64) as usize;
            self.read_raw_exact(&mut chunk[..take])?;
            sink.write_all(&chunk[..take])?;
            remaining -= take as u64;
        }
        Ok(())
    }
}

/// A DeviceLink frame is `[name, args...]`; returns the name and the rest.
pub fn split_message(value: &Value) -> Result<(&str, &[Value]), WireError> {
    let items = value
        .as_array()
        .ok_or_else(|| WireError::invalid("message frame is not an array"))?;
    let name = items
        .first()
        .and_then(Value::as_string)
        .ok_or_else(|| WireError::invalid("message frame has no name"))?;
    Ok((name, &items[1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory transport: reads from a scripted buffer, captures writes.
    struct ScriptedStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn frame(value: &Value) -> Vec<u8> {
        let mut body = Vec::new();
        value.to_writer_binary(&mut body).expect("encode");
        let mut framed = (body.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);
        framed
    }

    fn message(name: &str, args: Vec<Value>) -> Value {
        let mut items = vec![Value::String(name.to_string())];
        items.extend(args);
        Value::Array(items)
    }

    fn decode_frames(mut bytes: &[u8]) -> Vec<Value> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            let len = u32::from_be_bytes(bytes[..4].try_into().expect("len")) as usize;
            let body = &bytes[4..4 + len];
            frames.push(Value::from_reader(Cursor::new(body.to_vec())).expect("plist"));
            bytes = &bytes[4 + len..];
        }
        frames
    }

    #[test]
    fn round_trips_a_plist_frame() {
        let mut input = Vec::new();
        input.extend(frame(&message("DLMessagePing", vec![])));
        let mut link = DeviceLink::new(ScriptedStream::new(input));

        let received = link.receive_plist().expect("receive");
        let (name, args) = split_message(&received).expect("split");
        assert_eq!(name, "DLMessagePing");
        assert!(args.is_empty());
    }

    #[test]
    fn version_exchange_answers_versions_ok() {
        let mut input = Vec::new();
        input.extend(frame(&message(
            "DLMessageVersionExchange",
            vec![Value::Integer(300u64.into()), Value::Integer(0u64.into())],
        )));
        input.extend(frame(&message("DLMessageDeviceReady", vec![])));

        let mut link = DeviceLink::new(ScriptedStream::new(input));
        link.version_exchange().expect("exchange");

        let sent = decode_frames(&link.into_inner().output);
        assert_eq!(sent.len(), 1);
        let (name, args) = split_message(&sent[0]).expect("split");
        assert_eq!(name, "DLMessageVersionExchange");
        assert_eq!(args[0].as_string(), Some("DLVersionsOk"));
        assert_eq!(args[1].as_unsigned_integer(), Some(300));
    }

    #[test]
    fn version_exchange_rejects_unexpected_opening() {
        let mut input = Vec::new();
        input.extend(frame(&message("DLMessageDisconnect", vec![])));
        let mut link = DeviceLink::new(ScriptedStream::new(input));
        assert!(matches!(
            link.version_exchange(),
            Err(WireError::InvalidFrame(_))
        ));
    }

    #[test]
    fn status_response_defaults_to_empty_parameter_and_dict() {
        let mut link = DeviceLink::new(ScriptedStream::new(Vec::new()));
        link.send_status_response(0, None, None).expect("send");
        let sent = decode_frames(&link.into_inner().output);
        let (name, args) = split_message(&sent[0]).expect("split");
        assert_eq!(name, "DLMessageStatusResponse");
        assert_eq!(args[0].as_signed_integer(), Some(0));
        assert_eq!(args[1].as_string(), Some(EMPTY_PARAMETER));
        assert!(args[2].as_dictionary().is_some());
    }

    #[test]
    fn errno_style_status_carries_description() {
        let mut link = DeviceLink::new(ScriptedStream::new(Vec::new()));
        link.send_status_response(-6, Some("No such file or directory"), None)
            .expect("send");
        let sent = decode_frames(&link.into_inner().output);
        let (_, args) = split_message(&sent[0]).expect("split");
        assert_eq!(args[0].as_signed_integer(), Some(-6));
        assert_eq!(args[1].as_string(), Some("No such file or directory"));
    }

    #[test]
    fn raw_reads_cross_frame_boundaries() {
        let mut input = Vec::new();
        input.extend(5u32.to_be_bytes());
        input.push(0x0c);
        input.extend(b"data");
        input.extend(0u32.to_be_bytes());

        let mut link = DeviceLink::new(ScriptedStream::new(input));
        assert_eq!(link.read_raw_u32().expect("len"), 5);
        assert_eq!(link.read_raw_u8().expect("code"), 0x0c);
        let mut sink = Vec::new();
        link.copy_raw_to(4, &mut sink).expect("copy");
        assert_eq!(sink, b"data");
        assert_eq!(link.read_raw_u32().expect("terminator"), 0);
    }

    #[test]
    fn implausible_frame_length_is_rejected() {
        let mut input = Vec::new();
        input.extend(u32::MAX.to_be_bytes());
        let mut link = DeviceLink::new(ScriptedStream::new(input));
        assert!(matches!(
            link.receive_plist(),
            Err(WireError::InvalidFrame(_))
        ));
    }
}
