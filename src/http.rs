//! Just enough HTTP/1.x to capture and replay archived exchanges.
//!
//! Record blocks of response and request records are raw HTTP messages, so
//! the library needs to serialize a request, parse a response header and
//! pick the right body framing. Nothing more: no connection management, no
//! TLS, no HTTP/2.

use std::io::{self, BufRead, Read, Write};

use thiserror::Error;

use crate::body::chunked::ChunkedBody;
use crate::body::{LengthedBody, MessageBody};
use crate::headers::{HeaderName, MessageHeaders, MessageVersion, Protocol};
use crate::parser::{HeaderParser, ParseError};

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("invalid HTTP status line: {0:?}")]
    InvalidStatusLine(String),
    #[error(transparent)]
    Header(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// An outgoing request. Serialization only; the library never parses one.
pub struct HttpRequest {
    method: String,
    target: String,
    version: MessageVersion,
    headers: MessageHeaders,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        HttpRequest {
            method: method.into(),
            target: target.into(),
            version: MessageVersion::HTTP_1_0,
            headers: MessageHeaders::new(),
        }
    }

    pub fn header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.set(HeaderName::new_unchecked(name), value);
        self
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = write!(out, "{} {} {}\r\n", self.method, self.target, self.version);
        let _ = self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// A parsed response header: status line plus fields. The body stays on
/// the reader, framed by [`http_body`].
pub struct HttpResponse {
    version: MessageVersion,
    status: u16,
    reason: String,
    headers: MessageHeaders,
}

impl HttpResponse {
    /// Parses the status line and header fields, consuming up to and
    /// including the blank line. The reader is left at the first body byte.
    pub fn parse<R: BufRead>(reader: &mut R) -> Result<Self, HttpError> {
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line)?;
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);
        let (version, status, reason) = parse_status_line(text)
            .ok_or_else(|| HttpError::InvalidStatusLine(text.to_string()))?;

        let mut parser = HeaderParser::warc_fields();
        parser.set_lenient(true);
        loop {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                // Header block truncated by EOF; keep what parsed.
                parser.finish()?;
                break;
            }
            let consumed = parser.update(buf)?;
            reader.consume(consumed);
            if parser.is_finished() {
                break;
            }
        }

        Ok(HttpResponse {
            version,
            status,
            reason,
            headers: parser.take_headers(),
        })
    }

    pub fn version(&self) -> MessageVersion {
        self.version
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.first("Content-Type")
    }
}

fn parse_status_line(line: &str) -> Option<(MessageVersion, u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next()?;
    let status = parts.next()?.parse().ok()?;
    let reason = parts.next().unwrap_or("").to_string();

    let rest = version.strip_prefix("HTTP/")?;
    let (major, minor) = rest.split_once('.')?;
    let version = MessageVersion::new(
        Protocol::Http,
        major.parse().ok()?,
        minor.parse().ok()?,
    );
    Some((version, status, reason))
}

// ── Body framing ──────────────────────────────────────────────────────────────

/// A body delimited by connection close: reads until EOF.
pub struct CloseDelimited<R> {
    inner: R,
    position: u64,
}

impl<R: Read> Read for CloseDelimited<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(dst)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read> MessageBody for CloseDelimited<R> {
    fn size(&self) -> Option<u64> {
        None
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// An HTTP message body in whichever framing the headers call for.
pub enum HttpBody<R> {
    Length(LengthedBody<R>),
    Chunked(ChunkedBody<R>),
    Close(CloseDelimited<R>),
}

/// Selects the body framing: chunked transfer-encoding wins, then
/// `Content-Length`, then read-to-close.
pub fn http_body<R: Read>(headers: &MessageHeaders, reader: R) -> HttpBody<R> {
    if headers.contains_token("Transfer-Encoding", "chunked") {
        return HttpBody::Chunked(ChunkedBody::new(reader));
    }
    if let Some(length) = headers
        .first("Content-Length")
        .and_then(|v| v.trim().parse().ok())
    {
        return HttpBody::Length(LengthedBody::new(reader, length));
    }
    HttpBody::Close(CloseDelimited {
        inner: reader,
        position: 0,
    })
}

impl<R: Read> Read for HttpBody<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match self {
            HttpBody::Length(b) => b.read(dst),
            HttpBody::Chunked(b) => b.read(dst),
            HttpBody::Close(b) => b.read(dst),
        }
    }
}

impl<R: Read> MessageBody for HttpBody<R> {
    fn size(&self) -> Option<u64> {
        match self {
            HttpBody::Length(b) => b.size(),
            HttpBody::Chunked(b) => b.size(),
            HttpBody::Close(b) => b.size(),
        }
    }

    fn position(&self) -> u64 {
        match self {
            HttpBody::Length(b) => b.position(),
            HttpBody::Chunked(b) => b.position(),
            HttpBody::Close(b) => b.position(),
        }
    }

    fn is_consumed(&self) -> bool {
        match self {
            HttpBody::Length(b) => b.is_consumed(),
            HttpBody::Chunked(b) => b.is_consumed(),
            HttpBody::Close(b) => b.is_consumed(),
        }
    }
}
