use std::fmt::Display;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};

use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Peer sent bytes that are not valid RESP framing. The reply on the wire is
/// always the bare `ERR Protocol error`; the inner detail is for logs only.
#[derive(Debug, Error)]
#[error("ERR Protocol error")]
pub struct ProtocolError(pub String);

/// One RESP2 value. `Null` is the null bulk (`$-1`), `NullArray` the null
/// array (`*-1`). `File` is the snapshot payload sent after FULLRESYNC:
/// a bulk header and raw bytes with no trailing CRLF.
#[derive(Debug, Clone, PartialEq)]
pub enum RESP {
    String(String),
    Error(String),
    Int(i64),
    Bulk(Vec<u8>),
    Array(Vec<RESP>),
    Null,
    NullArray,
    File(Vec<u8>),
}

impl RESP {
    pub fn bulk(content: impl AsRef<[u8]>) -> RESP {
        RESP::Bulk(content.as_ref().to_vec())
    }

    /// Client-side helper: a command line as an array of bulk strings.
    pub fn command(parts: &[&str]) -> RESP {
        RESP::Array(parts.iter().map(RESP::bulk).collect())
    }
}

impl Display for RESP {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RESP::String(s) => write!(f, "{}", s),
            RESP::Error(s) => write!(f, "!{}", s),
            RESP::Int(i) => write!(f, "{}", i),
            RESP::Bulk(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            RESP::Array(array) => {
                for item in array {
                    write!(f, "{} ", item)?;
                }
                Ok(())
            }
            RESP::Null => write!(f, "null"),
            RESP::NullArray => write!(f, "null-array"),
            RESP::File(file) => write!(f, "File[{}]", file.len()),
        }
    }
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(Some((consumed, value)))` on a complete frame, `Ok(None)` when
/// more bytes are needed, and `Err` on malformed framing. Never reads past the
/// declared length of a bulk payload, so bulk contents may be arbitrary bytes.
pub fn decode(buf: &[u8]) -> Result<Option<(usize, RESP)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if !matches!(buf[0], b'+' | b'-' | b':' | b'$' | b'*') {
        return Err(ProtocolError(format!("unexpected type byte 0x{:02x}", buf[0])));
    }
    let Some((header_len, line)) = read_line(buf) else {
        return Ok(None);
    };
    match buf[0] {
        b'+' => Ok(Some((header_len, RESP::String(ascii_line(line)?)))),
        b'-' => Ok(Some((header_len, RESP::Error(ascii_line(line)?)))),
        b':' => Ok(Some((header_len, RESP::Int(parse_number(line)?)))),
        b'$' => {
            let len = parse_number(line)?;
            if len < 0 {
                return Ok(Some((header_len, RESP::Null)));
            }
            let len = len as usize;
            let total = header_len + len + 2;
            if buf.len() < total {
                return Ok(None);
            }
            if &buf[header_len + len..total] != b"\r\n" {
                return Err(ProtocolError("bulk payload not CRLF terminated".to_string()));
            }
            Ok(Some((total, RESP::Bulk(buf[header_len..header_len + len].to_vec()))))
        }
        b'*' => {
            let count = parse_number(line)?;
            if count < 0 {
                return Ok(Some((header_len, RESP::NullArray)));
            }
            let mut consumed = header_len;
            // capacity from the wire is untrusted
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                match decode(&buf[consumed..])? {
                    None => return Ok(None),
                    Some((item_len, item)) => {
                        consumed += item_len;
                        items.push(item);
                    }
                }
            }
            Ok(Some((consumed, RESP::Array(items))))
        }
        _ => Err(ProtocolError(format!("unexpected type byte 0x{:02x}", buf[0]))),
    }
}

/// First line of `buf` up to CRLF, without the type byte and terminator.
/// The returned length covers the full line including the CRLF. Only called
/// after the type byte is validated, so the CRLF is at index 1 or later.
fn read_line(buf: &[u8]) -> Option<(usize, &[u8])> {
    buf.windows(2)
        .position(|window| window == b"\r\n")
        .map(|pos| (pos + 2, &buf[1..pos]))
}

fn ascii_line(line: &[u8]) -> Result<String, ProtocolError> {
    String::from_utf8(line.to_vec())
        .map_err(|_| ProtocolError("non UTF-8 simple string".to_string()))
}

fn parse_number(line: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ProtocolError(format!("invalid length/integer line: {:?}", String::from_utf8_lossy(line)))
        })
}

/// Canonical encoding: exact byte lengths, CRLF everywhere it belongs,
/// nothing else.
pub fn encode(message: &RESP, out: &mut Vec<u8>) {
    match message {
        RESP::String(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RESP::Error(s) => {
            out.push(b'-');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RESP::Int(n) => {
            out.extend_from_slice(format!(":{}\r\n", n).as_bytes());
        }
        RESP::Bulk(b) => {
            out.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
            out.extend_from_slice(b);
            out.extend_from_slice(b"\r\n");
        }
        RESP::Null => out.extend_from_slice(b"$-1\r\n"),
        RESP::NullArray => out.extend_from_slice(b"*-1\r\n"),
        RESP::Array(array) => {
            out.extend_from_slice(format!("*{}\r\n", array.len()).as_bytes());
            for item in array {
                encode(item, out);
            }
        }
        RESP::File(file) => {
            out.extend_from_slice(format!("${}\r\n", file.len()).as_bytes());
            out.extend_from_slice(file);
        }
    }
}

pub fn encode_to_vec(message: &RESP) -> Vec<u8> {
    let mut out = Vec::new();
    encode(message, &mut out);
    out
}

/// A RESP framed TCP connection. Partial frames are retained in the receive
/// buffer across reads; every decoded frame is handed back together with its
/// original wire bytes so mutations can be forwarded to replicas verbatim.
pub struct RESPConnection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl RESPConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Read the next complete frame. `Ok(None)` means the peer closed the
    /// connection cleanly at a frame boundary.
    pub fn read_message(&mut self) -> Result<Option<(Bytes, RESP)>> {
        loop {
            if !self.buffer.is_empty() {
                if let Some((consumed, message)) = decode(&self.buffer)? {
                    let frame = self.buffer.split_to(consumed).freeze();
                    return Ok(Some((frame, message)));
                }
            }
            if !self.fill()? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                bail!("connection closed by peer mid-frame");
            }
        }
    }

    /// Read the snapshot blob that follows FULLRESYNC: `$<n>\r\n<n bytes>`
    /// with no trailing CRLF.
    pub fn read_snapshot(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.buffer.windows(2).position(|w| w == b"\r\n") {
                if self.buffer.first() != Some(&b'$') {
                    bail!(
                        "expected snapshot bulk header, got: {:?}",
                        String::from_utf8_lossy(&self.buffer[..pos])
                    );
                }
                let len = parse_number(&self.buffer[1..pos])?;
                if len < 0 {
                    bail!("negative snapshot length");
                }
                let total = pos + 2 + len as usize;
                if self.buffer.len() >= total {
                    let frame = self.buffer.split_to(total);
                    return Ok(frame[pos + 2..].to_vec());
                }
            }
            if !self.fill()? {
                bail!("connection closed while reading snapshot");
            }
        }
    }

    fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 4 * 1024];
        let read = self.stream.read(&mut chunk)?;
        if read == 0 {
            return Ok(false);
        }
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(true)
    }

    pub fn send_message(&mut self, message: &RESP) -> Result<usize> {
        self.send_messages(&[message])
    }

    pub fn send_messages(&mut self, messages: &[&RESP]) -> Result<usize> {
        let mut out = Vec::new();
        for message in messages {
            encode(message, &mut out);
        }
        self.send_raw(&out)?;
        Ok(out.len())
    }

    /// Write pre-encoded bytes as-is (replication fan-out).
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }
}
