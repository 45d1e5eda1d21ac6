//! RESP (Redis serialization protocol) parsing and generation.
//!
//! The parser is incremental: it never consumes bytes from the input buffer
//! until a complete value is available, so callers can feed it partial reads
//! straight off a socket.

pub mod command;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::str;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use command::Command;

/// RESP data types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:123\r\n)
    Integer(i64),
    /// Bulk String ($5\r\nhello\r\n), None represents NULL
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...), None represents a NULL array
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn error<S: Into<String>>(msg: S) -> Self {
        RespValue::Error(msg.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Encode this value to wire format
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode this value into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    element.encode_into(buf);
                }
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
        }
    }
}

/// Parse error types
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("invalid integer: {0}")]
    InvalidInteger(#[from] std::num::ParseIntError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental RESP parser
pub struct RespParser;

impl RespParser {
    /// Parse one RESP value from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete value;
    /// in that case no bytes are consumed.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        let mut pos = 0;
        match Self::parse_at(buf.as_ref(), &mut pos)? {
            Some(value) => {
                buf.advance(pos);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn parse_at(data: &[u8], pos: &mut usize) -> Result<Option<RespValue>, RespError> {
        if *pos >= data.len() {
            return Ok(None);
        }
        let kind = data[*pos];
        match kind {
            b'+' | b'-' | b':' => {
                let line = match Self::read_line(data, pos) {
                    Some(line) => line,
                    None => return Ok(None),
                };
                let content = str::from_utf8(&line[1..])?;
                Ok(Some(match kind {
                    b'+' => RespValue::SimpleString(content.to_string()),
                    b'-' => RespValue::Error(content.to_string()),
                    _ => RespValue::Integer(content.parse()?),
                }))
            }
            b'$' => {
                let line = match Self::read_line(data, pos) {
                    Some(line) => line,
                    None => return Ok(None),
                };
                let size: i64 = str::from_utf8(&line[1..])?.parse()?;
                if size == -1 {
                    return Ok(Some(RespValue::BulkString(None)));
                }
                if size < 0 {
                    return Err(RespError::InvalidFormat(
                        "negative bulk string length".to_string(),
                    ));
                }
                let size = size as usize;
                if data.len() < *pos + size + 2 {
                    return Ok(None);
                }
                let content = Bytes::copy_from_slice(&data[*pos..*pos + size]);
                if &data[*pos + size..*pos + size + 2] != b"\r\n" {
                    return Err(RespError::InvalidFormat(
                        "bulk string not terminated by CRLF".to_string(),
                    ));
                }
                *pos += size + 2;
                Ok(Some(RespValue::BulkString(Some(content))))
            }
            b'*' => {
                let line = match Self::read_line(data, pos) {
                    Some(line) => line,
                    None => return Ok(None),
                };
                let size: i64 = str::from_utf8(&line[1..])?.parse()?;
                if size == -1 {
                    return Ok(Some(RespValue::Array(None)));
                }
                if size < 0 {
                    return Err(RespError::InvalidFormat(
                        "negative array length".to_string(),
                    ));
                }
                let mut elements = Vec::with_capacity(size as usize);
                for _ in 0..size {
                    match Self::parse_at(data, pos)? {
                        Some(element) => elements.push(element),
                        None => return Ok(None),
                    }
                }
                Ok(Some(RespValue::Array(Some(elements))))
            }
            other => Err(RespError::InvalidFormat(format!(
                "unknown RESP type byte: {:#04x}",
                other
            ))),
        }
    }

    /// Read one CRLF-terminated line starting at `*pos`, without the CRLF.
    /// Advances `*pos` past the line on success.
    fn read_line<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
        let start = *pos;
        let rel = data[start..].windows(2).position(|w| w == b"\r\n")?;
        *pos = start + rel + 2;
        Some(&data[start..start + rel])
    }
}

/// Buffered RESP reader over an async byte stream.
///
/// Used for both client sockets (commands, including the inline form) and
/// backend sockets (replies).
pub struct RespReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> RespReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Read one complete RESP value
    pub async fn read_value(&mut self) -> Result<RespValue, RespError> {
        loop {
            if let Some(value) = RespParser::parse(&mut self.buf)? {
                return Ok(value);
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return Err(RespError::ConnectionClosed);
            }
        }
    }

    /// Read one client command, accepting both the multi-bulk and the
    /// inline form.
    pub async fn read_command(&mut self) -> Result<Command, RespError> {
        loop {
            if !self.buf.is_empty() {
                if self.buf[0] == b'*' {
                    if let Some(value) = RespParser::parse(&mut self.buf)? {
                        return Command::from_resp(value);
                    }
                } else if let Some(nl) = self.buf.iter().position(|&b| b == b'\n') {
                    let line = self.buf.split_to(nl + 1);
                    let line = &line[..nl];
                    let line = line.strip_suffix(b"\r").unwrap_or(line);
                    let args: Vec<Bytes> = line
                        .split(|&b| b == b' ')
                        .filter(|part| !part.is_empty())
                        .map(Bytes::copy_from_slice)
                        .collect();
                    if args.is_empty() {
                        continue;
                    }
                    return Command::from_args(args);
                }
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return Err(RespError::ConnectionClosed);
            }
        }
    }
}
