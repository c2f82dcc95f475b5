//! PostgreSQL wire framing.
//!
//! After the untagged startup packet, every message in either direction is a
//! one-byte tag, a big-endian `i32` length that counts itself, and the
//! payload. [`FrameCodec`] splits a byte stream into [`Frame`]s without
//! interpreting them, so re-encoding a decoded frame yields the original
//! bytes. The few messages the proxy needs to look inside are parsed on
//! demand by the helpers at the bottom of this module.
//!
//! See "Frontend/Backend Protocol: Message Formats" in the PostgreSQL
//! reference.

use std::borrow::Cow;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

/// `SSLRequest` code in place of a protocol version.
pub const SSL_REQUEST_CODE: i32 = 80877103;
/// `GSSENCRequest` code.
pub const GSSENC_REQUEST_CODE: i32 = 80877104;
/// `CancelRequest` code.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
/// Protocol 3.0.
pub const PROTOCOL_VERSION_3: i32 = 196608;

/// Largest tagged message accepted. The server's own limit is 1 GiB.
pub const MAX_FRAME_LEN: usize = 1 << 30;
/// Largest startup packet accepted, as in the server.
pub const MAX_STARTUP_LEN: usize = 10_000;
/// Largest message accepted before the client has authenticated, as the
/// server limits authentication tokens.
pub const MAX_AUTH_FRAME_LEN: usize = 65_535;

/// Frontend message tags.
pub mod frontend {
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const SYNC: u8 = b'S';
    pub const FLUSH: u8 = b'H';
    pub const CLOSE: u8 = b'C';
    pub const TERMINATE: u8 = b'X';
    pub const PASSWORD: u8 = b'p';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const COPY_FAIL: u8 = b'f';
    pub const FUNCTION_CALL: u8 = b'F';
}

/// Backend message tags.
pub mod backend {
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const NO_DATA: u8 = b'n';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const COPY_IN_RESPONSE: u8 = b'G';
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    pub const COPY_BOTH_RESPONSE: u8 = b'W';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const FUNCTION_CALL_RESPONSE: u8 = b'V';
    pub const NEGOTIATE_PROTOCOL_VERSION: u8 = b'v';
}

/// Authentication request codes carried by `R` messages.
pub mod auth {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}

/// Errors raised while framing or parsing messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message length {0}")]
    InvalidLength(i64),

    #[error("message of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("malformed {message} message: {reason}")]
    Malformed {
        message: &'static str,
        reason: &'static str,
    },
}

fn malformed(message: &'static str, reason: &'static str) -> CodecError {
    CodecError::Malformed { message, reason }
}

/// One tagged protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub body: Bytes,
}

impl Frame {
    pub fn new(tag: u8, body: impl Into<Bytes>) -> Self {
        Self {
            tag,
            body: body.into(),
        }
    }

    /// Size on the wire, header included.
    pub fn wire_len(&self) -> usize {
        5 + self.body.len()
    }

    /// Tag as a printable character, for logs.
    pub fn tag_char(&self) -> char {
        char::from(self.tag)
    }

    /// Encode into a standalone buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        put_frame(&mut buf, self);
        buf
    }
}

fn put_frame(dst: &mut BytesMut, frame: &Frame) {
    dst.reserve(frame.wire_len());
    dst.put_u8(frame.tag);
    dst.put_u32((frame.body.len() + 4) as u32);
    dst.extend_from_slice(&frame.body);
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Head,
    Data(u8, usize),
}

/// Splits a stream into [`Frame`]s and writes frames back unchanged.
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            state: DecodeState::Head,
            max_frame_len,
        }
    }

    /// Applies to frames whose header has not been read yet.
    pub fn set_max_frame_len(&mut self, max_frame_len: usize) {
        self.max_frame_len = max_frame_len;
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.state {
                DecodeState::Head => {
                    if src.len() < 5 {
                        return Ok(None);
                    }
                    let tag = src[0];
                    let len = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
                    if len < 4 {
                        return Err(CodecError::InvalidLength(len.into()));
                    }
                    let body_len = (len - 4) as usize;
                    if body_len > self.max_frame_len {
                        return Err(CodecError::TooLarge {
                            len: body_len,
                            max: self.max_frame_len,
                        });
                    }
                    // The buffer grows as the body arrives; a declared length
                    // alone allocates nothing.
                    src.advance(5);
                    self.state = DecodeState::Data(tag, body_len);
                }
                DecodeState::Data(tag, body_len) => {
                    if src.len() < body_len {
                        return Ok(None);
                    }
                    let body = src.split_to(body_len).freeze();
                    src.reserve(5);
                    self.state = DecodeState::Head;
                    return Ok(Some(Frame { tag, body }));
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        put_frame(dst, &frame);
        Ok(())
    }
}

// =============================================================================
// Startup packets
// =============================================================================

/// Key identifying a backend for `CancelRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CancelKey {
    pub process_id: i32,
    pub secret_key: Bytes,
}

impl CancelKey {
    /// Encode as a `CancelRequest` packet.
    pub fn to_cancel_request(&self) -> BytesMut {
        let len = 12 + self.secret_key.len();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_i32(len as i32);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.extend_from_slice(&self.secret_key);
        buf
    }

    /// Parse the body of a `BackendKeyData` message.
    pub fn from_backend_key_data(body: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(body, "BackendKeyData");
        let process_id = cursor.read_i32()?;
        Ok(Self {
            process_id,
            secret_key: Bytes::copy_from_slice(cursor.rest()),
        })
    }
}

/// `StartupMessage` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPacket {
    pub version: i32,
    pub params: Vec<(String, String)>,
}

impl StartupPacket {
    pub fn new(params: Vec<(String, String)>) -> Self {
        Self {
            version: PROTOCOL_VERSION_3,
            params,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32(0);
        buf.put_i32(self.version);
        for (key, value) in &self.params {
            put_cstr(&mut buf, key);
            put_cstr(&mut buf, value);
        }
        buf.put_u8(0);
        let len = buf.len() as i32;
        buf[..4].copy_from_slice(&len.to_be_bytes());
        buf
    }
}

/// The first packet a client sends on a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupRequest {
    Ssl,
    GssEnc,
    Cancel(CancelKey),
    Startup(StartupPacket),
}

/// Read one untagged startup packet. Returns `None` if the peer closes the
/// connection before sending anything.
pub async fn read_startup<R>(reader: &mut R) -> Result<Option<StartupRequest>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = i32::from_be_bytes(len_buf);
    if len < 8 || len as usize > MAX_STARTUP_LEN {
        return Err(CodecError::InvalidLength(len.into()));
    }

    let mut body = vec![0u8; len as usize - 4];
    reader.read_exact(&mut body).await?;
    let mut cursor = Cursor::new(&body, "StartupMessage");
    let code = cursor.read_i32()?;

    let request = match code {
        SSL_REQUEST_CODE => StartupRequest::Ssl,
        GSSENC_REQUEST_CODE => StartupRequest::GssEnc,
        CANCEL_REQUEST_CODE => {
            let process_id = cursor.read_i32()?;
            StartupRequest::Cancel(CancelKey {
                process_id,
                secret_key: Bytes::copy_from_slice(cursor.rest()),
            })
        }
        version => {
            let mut params = Vec::new();
            loop {
                let key = cursor.read_cstr()?;
                if key.is_empty() {
                    break;
                }
                let value = cursor.read_cstr()?;
                params.push((key.to_string(), value.to_string()));
            }
            StartupRequest::Startup(StartupPacket { version, params })
        }
    };
    Ok(Some(request))
}

// =============================================================================
// Messages built by the proxy
// =============================================================================

/// Fields of an `ErrorResponse` or `NoticeResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ErrorFields {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR".to_string(),
            code: code.to_string(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    pub fn fatal(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: "FATAL".to_string(),
            ..Self::error(code, message)
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u8(b'S');
        put_cstr(&mut buf, &self.severity);
        buf.put_u8(b'V');
        put_cstr(&mut buf, &self.severity);
        buf.put_u8(b'C');
        put_cstr(&mut buf, &self.code);
        buf.put_u8(b'M');
        put_cstr(&mut buf, &self.message);
        if let Some(detail) = &self.detail {
            buf.put_u8(b'D');
            put_cstr(&mut buf, detail);
        }
        if let Some(hint) = &self.hint {
            buf.put_u8(b'H');
            put_cstr(&mut buf, hint);
        }
        buf.put_u8(0);
        Frame::new(backend::ERROR_RESPONSE, buf.freeze())
    }

    /// Parse the body of an `ErrorResponse`. Unknown fields are ignored.
    pub fn parse(body: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(body, "ErrorResponse");
        let mut fields = Self::error("", "");
        let mut localized_severity = None;
        loop {
            let field = cursor.read_u8()?;
            if field == 0 {
                break;
            }
            let value = cursor.read_cstr()?.to_string();
            match field {
                b'S' => localized_severity = Some(value),
                b'V' => fields.severity = value,
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                _ => {}
            }
        }
        // Servers before 9.6 only send the localized severity.
        if fields.severity == "ERROR" {
            if let Some(severity) = localized_severity {
                fields.severity = severity;
            }
        }
        Ok(fields)
    }
}

/// `ReadyForQuery` with the given transaction status (`I`, `T` or `E`).
pub fn ready_for_query(status: u8) -> Frame {
    Frame::new(backend::READY_FOR_QUERY, vec![status])
}

fn authentication(code: i32, extra: &[u8]) -> Frame {
    let mut buf = BytesMut::with_capacity(4 + extra.len());
    buf.put_i32(code);
    buf.extend_from_slice(extra);
    Frame::new(backend::AUTHENTICATION, buf.freeze())
}

pub fn auth_ok() -> Frame {
    authentication(auth::OK, &[])
}

pub fn auth_cleartext_password() -> Frame {
    authentication(auth::CLEARTEXT_PASSWORD, &[])
}

/// `NegotiateProtocolVersion`: the newest minor version supported and the
/// `_pq_.` options that were not recognized.
pub fn negotiate_protocol_version(newest_minor: i32, unrecognized: &[&str]) -> Frame {
    let mut buf = BytesMut::new();
    buf.put_i32(newest_minor);
    buf.put_i32(unrecognized.len() as i32);
    for option in unrecognized {
        put_cstr(&mut buf, option);
    }
    Frame::new(backend::NEGOTIATE_PROTOCOL_VERSION, buf.freeze())
}

pub fn password_message(password: &str) -> Frame {
    let mut buf = BytesMut::new();
    put_cstr(&mut buf, password);
    Frame::new(frontend::PASSWORD, buf.freeze())
}

pub fn sasl_initial_response(mechanism: &str, data: &[u8]) -> Frame {
    let mut buf = BytesMut::new();
    put_cstr(&mut buf, mechanism);
    buf.put_i32(data.len() as i32);
    buf.extend_from_slice(data);
    Frame::new(frontend::PASSWORD, buf.freeze())
}

pub fn sasl_response(data: &[u8]) -> Frame {
    Frame::new(frontend::PASSWORD, Bytes::copy_from_slice(data))
}

pub fn terminate() -> Frame {
    Frame::new(frontend::TERMINATE, Bytes::new())
}

// =============================================================================
// Messages parsed by the proxy
// =============================================================================

/// `Parse`: statement name and SQL text. Parameter types are not needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMessage {
    pub statement: String,
    pub sql: String,
}

/// `Bind`: destination portal and source statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
}

/// `Execute`: portal and row limit (0 means all).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteMessage {
    pub portal: String,
    pub max_rows: i32,
}

/// Object kind addressed by `Close` and `Describe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Statement,
    Portal,
}

/// `Close` or `Describe` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub kind: TargetKind,
    pub name: String,
}

pub fn parse_query(body: &[u8]) -> Result<String, CodecError> {
    Ok(Cursor::new(body, "Query").read_cstr()?.to_string())
}

pub fn parse_parse(body: &[u8]) -> Result<ParseMessage, CodecError> {
    let mut cursor = Cursor::new(body, "Parse");
    let statement = cursor.read_cstr()?.to_string();
    let sql = cursor.read_cstr()?.to_string();
    Ok(ParseMessage { statement, sql })
}

pub fn parse_bind(body: &[u8]) -> Result<BindMessage, CodecError> {
    let mut cursor = Cursor::new(body, "Bind");
    let portal = cursor.read_cstr()?.to_string();
    let statement = cursor.read_cstr()?.to_string();
    Ok(BindMessage { portal, statement })
}

pub fn parse_execute(body: &[u8]) -> Result<ExecuteMessage, CodecError> {
    let mut cursor = Cursor::new(body, "Execute");
    let portal = cursor.read_cstr()?.to_string();
    let max_rows = cursor.read_i32()?;
    Ok(ExecuteMessage { portal, max_rows })
}

/// Parse the body of a `Close` or `Describe`.
pub fn parse_target(body: &[u8]) -> Result<Target, CodecError> {
    let mut cursor = Cursor::new(body, "Close/Describe");
    let kind = match cursor.read_u8()? {
        b'S' => TargetKind::Statement,
        b'P' => TargetKind::Portal,
        _ => return Err(malformed("Close/Describe", "unknown target type")),
    };
    let name = cursor.read_cstr()?.to_string();
    Ok(Target { kind, name })
}

/// Command tag of a `CommandComplete` (`SELECT 3`, `INSERT 0 1`).
pub fn parse_command_complete(body: &[u8]) -> Result<String, CodecError> {
    Ok(Cursor::new(body, "CommandComplete").read_cstr()?.to_string())
}

/// Row count carried by a command tag, if the command reports one.
pub fn rows_from_command_tag(tag: &str) -> Option<u64> {
    let mut words = tag.split_whitespace();
    let command = words.next()?;
    match command {
        "INSERT" | "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "MOVE" | "FETCH" | "COPY" => {
            words.last()?.parse().ok()
        }
        _ => None,
    }
}

/// Authentication request code and the bytes after it.
pub fn parse_authentication(body: &[u8]) -> Result<(i32, &[u8]), CodecError> {
    let mut cursor = Cursor::new(body, "Authentication");
    let code = cursor.read_i32()?;
    Ok((code, cursor.rest()))
}

/// SASL mechanism names offered in an `AuthenticationSASL` message.
pub fn parse_sasl_mechanisms(data: &[u8]) -> Result<Vec<String>, CodecError> {
    let mut cursor = Cursor::new(data, "AuthenticationSASL");
    let mut mechanisms = Vec::new();
    loop {
        let name = cursor.read_cstr()?;
        if name.is_empty() {
            break;
        }
        mechanisms.push(name.to_string());
    }
    Ok(mechanisms)
}

/// `PasswordMessage` contents.
pub fn parse_password(body: &[u8]) -> Result<String, CodecError> {
    Ok(Cursor::new(body, "PasswordMessage").read_cstr()?.to_string())
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Reader over a message body.
struct Cursor<'a> {
    buf: &'a [u8],
    message: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], message: &'static str) -> Self {
        Self { buf, message }
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        let (&byte, rest) = self
            .buf
            .split_first()
            .ok_or_else(|| malformed(self.message, "truncated"))?;
        self.buf = rest;
        Ok(byte)
    }

    fn read_i32(&mut self) -> Result<i32, CodecError> {
        if self.buf.len() < 4 {
            return Err(malformed(self.message, "truncated"));
        }
        let (head, rest) = self.buf.split_at(4);
        self.buf = rest;
        Ok(i32::from_be_bytes([head[0], head[1], head[2], head[3]]))
    }

    /// A NUL-terminated string. Text in a non-UTF-8 client encoding is
    /// decoded lossily; the frame itself is always forwarded as received.
    fn read_cstr(&mut self) -> Result<Cow<'a, str>, CodecError> {
        let nul = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| malformed(self.message, "missing string terminator"))?;
        let s = String::from_utf8_lossy(&self.buf[..nul]);
        self.buf = &self.buf[nul + 1..];
        Ok(s)
    }

    fn rest(&self) -> &'a [u8] {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cstrs(parts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in parts {
            out.extend_from_slice(p.as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn test_decode_is_byte_exact() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&Frame::new(b'Q', cstrs(&["SELECT 1"])).to_bytes());
        wire.extend_from_slice(&[b'S', 0, 0, 0, 4]);
        let original = wire.clone();

        let mut codec = FrameCodec::new();
        let mut out = BytesMut::new();
        while let Some(frame) = codec.decode(&mut wire).unwrap() {
            codec.encode(frame, &mut out).unwrap();
        }
        assert_eq!(out, original);
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let full = Frame::new(b'Q', cstrs(&["SELECT 1"])).to_bytes();
        let mut codec = FrameCodec::new();

        let mut partial = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[3..8]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[8..]);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(parse_query(&frame.body).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[b'Q', 0, 0, 0, 3][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::InvalidLength(3))
        ));

        let mut codec = FrameCodec::with_max_frame_len(16);
        let mut buf = BytesMut::from(&[b'Q', 0, 0, 1, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_declared_length_does_not_allocate() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::with_capacity(64);
        buf.extend_from_slice(&[b'p', 0x3f, 0xff, 0xff, 0xff]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.capacity() <= 64);

        let mut codec = FrameCodec::with_max_frame_len(MAX_AUTH_FRAME_LEN);
        let mut buf = BytesMut::from(&[b'p', 0x3f, 0xff, 0xff, 0xff][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::TooLarge { max: MAX_AUTH_FRAME_LEN, .. })
        ));

        codec.set_max_frame_len(MAX_FRAME_LEN);
        let mut buf = BytesMut::from(&[b'p', 0x3f, 0xff, 0xff, 0xff][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_non_utf8_text_is_decoded_lossily() {
        let body = b"SELECT 'caf\xe9'\0";
        assert_eq!(parse_query(body).unwrap(), "SELECT 'caf\u{fffd}'");

        let parse = parse_parse(&[&b"s\xff\0INSERT INTO t VALUES ('\xe9')\0"[..], &[0, 0]].concat())
            .unwrap();
        assert_eq!(parse.statement, "s\u{fffd}");
        assert!(parse.sql.starts_with("INSERT INTO t"));
    }

    #[tokio::test]
    async fn test_read_startup_variants() {
        let packet = StartupPacket::new(vec![
            ("user".to_string(), "alice".to_string()),
            ("database".to_string(), "sales".to_string()),
        ]);
        let bytes = packet.to_bytes();
        let parsed = read_startup(&mut &bytes[..]).await.unwrap().unwrap();
        let StartupRequest::Startup(parsed) = parsed else {
            panic!("expected startup");
        };
        assert_eq!(parsed.get("user"), Some("alice"));
        assert_eq!(parsed.get("database"), Some("sales"));
        assert_eq!(parsed.version, PROTOCOL_VERSION_3);

        let ssl = [0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f];
        assert_eq!(
            read_startup(&mut &ssl[..]).await.unwrap(),
            Some(StartupRequest::Ssl)
        );

        let key = CancelKey {
            process_id: 42,
            secret_key: Bytes::from_static(&[0, 0, 0, 7]),
        };
        let cancel = key.to_cancel_request();
        assert_eq!(
            read_startup(&mut &cancel[..]).await.unwrap(),
            Some(StartupRequest::Cancel(key))
        );

        let empty: &[u8] = &[];
        assert_eq!(read_startup(&mut &empty[..]).await.unwrap(), None);
    }

    #[test]
    fn test_error_fields_round_trip() {
        let fields = ErrorFields::error("53400", "query quota exceeded").with_detail("queries used: 5");
        let frame = fields.to_frame();
        assert_eq!(frame.tag, backend::ERROR_RESPONSE);
        assert_eq!(ErrorFields::parse(&frame.body).unwrap(), fields);
    }

    #[test]
    fn test_parse_extended_messages() {
        let parse = parse_parse(&[cstrs(&["s1", "SELECT $1"]), vec![0, 0]].concat()).unwrap();
        assert_eq!(parse.statement, "s1");
        assert_eq!(parse.sql, "SELECT $1");

        let bind = parse_bind(&[cstrs(&["", "s1"]), vec![0, 0, 0, 0, 0, 0]].concat()).unwrap();
        assert_eq!(bind.portal, "");
        assert_eq!(bind.statement, "s1");

        let execute = parse_execute(&[cstrs(&["p"]), vec![0, 0, 0, 10]].concat()).unwrap();
        assert_eq!(execute.max_rows, 10);

        let close = parse_target(&[vec![b'S'], cstrs(&["s1"])].concat()).unwrap();
        assert_eq!(close.kind, TargetKind::Statement);
        assert!(parse_target(&[vec![b'X'], cstrs(&["s1"])].concat()).is_err());
    }

    #[test]
    fn test_rows_from_command_tag() {
        assert_eq!(rows_from_command_tag("SELECT 3"), Some(3));
        assert_eq!(rows_from_command_tag("INSERT 0 5"), Some(5));
        assert_eq!(rows_from_command_tag("UPDATE 0"), Some(0));
        assert_eq!(rows_from_command_tag("CREATE TABLE"), None);
        assert_eq!(rows_from_command_tag("BEGIN"), None);
    }
}
