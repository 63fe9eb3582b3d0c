use std::io::{Read, Write};

use crate::app::error::WireError;

/// Longest FAIL message / snapshot payload we are willing to buffer.
const MAX_BLOCK_LEN: usize = 0xffff;

/// Frames a smart-socket request: four lowercase hex digits carrying the
/// body length, then the body itself.
pub fn write_request<W: Write>(writer: &mut W, body: &str) -> Result<(), WireError> {
    if body.len() > MAX_BLOCK_LEN {
        return Err(WireError::invalid(format!(
            "request body too long: {} bytes",
            body.len()
        )));
    }
    let framed = format!("{:04x}{}", body.len(), body);
    writer.write_all(framed.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Sends a request and consumes the 4-byte status. `OKAY` leaves the stream
/// positioned at the payload; `FAIL` reads the server's message and closes
/// the exchange with `ProtocolFail`.
pub fn send_request<S: Read + Write>(stream: &mut S, body: &str) -> Result<(), WireError> {
    write_request(stream, body)?;

    let mut status = [0u8; 4];
    read_exact(stream, &mut status)?;
    match &status {
        b"OKAY" => Ok(()),
        b"FAIL" => {
            let message = read_len_block(stream)?;
            Err(WireError::ProtocolFail(
                String::from_utf8_lossy(&message).into_owned(),
            ))
        }
        _ => Err(WireError::UnexpectedResponse(status)),
    }
}

/// One `LLLL` + payload block. A zero length is legal (heartbeat) and
/// yields an empty buffer.
pub fn read_len_block<R: Read>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut header = [0u8; 4];
    read_exact(reader, &mut header)?;
    let len = parse_hex_len(&header)?;
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut payload = vec![0u8; len];
    read_exact(reader, &mut payload)?;
    Ok(payload)
}

/// Exact-N read that loops on partial reads. A clean EOF before any byte
/// maps to `ShortRead` so callers can distinguish "peer went away" from a
/// torn frame by the byte counts.
pub fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
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

fn parse_hex_len(header: &[u8; 4]) -> Result<usize, WireError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| WireError::invalid("length header is not ASCII"))?;
    usize::from_str_radix(text, 16)
        .map_err(|_| WireError::invalid(format!("bad length header {text:?}")))
}
