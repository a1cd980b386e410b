//! Record writing and remote fetching.
//!
//! `WarcWriter` serializes records to a sink, optionally compressing each
//! record as its own gzip member so the output stays seekable by record.
//! `fetch` downloads an HTTP resource and writes the exchange as a
//! response and request record pair.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};
use url::Url;

use crate::body::gzip::GzipSink;
use crate::digest::{digester, WarcDigest};
use crate::error::{Result, WarcError};
use crate::http::{http_body, HttpRequest, HttpResponse};
use crate::reader::Compression;
use crate::record::{OwnedBody, TruncationReason, WarcBuilder, WarcRecord, WarcType};

const TRAILER: &[u8] = b"\r\n\r\n";
const DIGEST_ALGORITHM: &str = "sha1";

enum Sink<W: Write> {
    Plain(W),
    Gzip(GzipSink<W>),
}

impl<W: Write> Write for Sink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

pub struct WarcWriter<W: Write> {
    sink: Sink<W>,
    position: u64,
}

impl<W: Write> WarcWriter<W> {
    /// Wraps a sink. With gzip each record becomes one member, the
    /// conventional layout for compressed WARC files. Zstd output is not
    /// supported.
    pub fn new(sink: W, compression: Compression) -> Result<Self> {
        let sink = match compression {
            Compression::None => Sink::Plain(sink),
            Compression::Gzip => Sink::Gzip(GzipSink::new(sink)),
            Compression::Zstd => return Err(WarcError::Unsupported("zstd output")),
        };
        Ok(WarcWriter { sink, position: 0 })
    }

    /// Byte offset the next record will be written at, relative to where
    /// the sink started.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Serializes one record. The body is streamed through and must match
    /// the record's `Content-Length`.
    pub fn write<B: Read>(&mut self, record: &mut WarcRecord<B>) -> Result<()> {
        let content_length = record.content_length();
        let mut head = Vec::new();
        // Records synthesized from ARC input are re-serialized as WARC.
        let version = match record.version().protocol {
            crate::headers::Protocol::Arc => crate::headers::MessageVersion::WARC_1_1,
            _ => record.version(),
        };
        write!(head, "{}\r\n", version)?;
        record.headers().write_to(&mut head)?;
        head.extend_from_slice(b"\r\n");

        self.sink.write_all(&head)?;
        let copied = io::copy(record.body_mut(), &mut self.sink)?;
        if copied != content_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "record body was {} bytes but Content-Length is {}",
                    copied, content_length
                ),
            )
            .into());
        }
        self.sink.write_all(TRAILER)?;

        match &mut self.sink {
            Sink::Plain(_) => {
                self.position += head.len() as u64 + copied + TRAILER.len() as u64;
            }
            Sink::Gzip(gz) => {
                gz.finish()?;
                self.position = gz.output_position();
            }
        }
        Ok(())
    }

    /// Downloads `uri` over plain HTTP and records the exchange: the
    /// response record first, then the request record marked concurrent to
    /// it. Block digests cover the raw messages; the response additionally
    /// carries a payload digest when its HTTP body is non-empty and
    /// parsable.
    pub fn fetch(&mut self, uri: &Url, options: &FetchOptions) -> Result<FetchResult> {
        if uri.scheme() != "http" {
            return Err(WarcError::Unsupported("only http URLs can be fetched"));
        }
        let host = uri
            .host_str()
            .ok_or(WarcError::Unsupported("URL without a host"))?;
        let port = uri.port().unwrap_or(80);

        let mut target = uri.path().to_string();
        if target.is_empty() {
            target.push('/');
        }
        if let Some(query) = uri.query() {
            target.push('?');
            target.push_str(query);
        }
        let mut http_request = HttpRequest::new("GET", target);
        http_request.header("Host", host);
        http_request.header("User-Agent", options.user_agent.clone());
        http_request.header("Connection", "close");
        let request_bytes = http_request.serialize();

        let mut request_digest = digester(DIGEST_ALGORITHM)?;
        request_digest.update(&request_bytes);

        let date = Utc::now();
        let started = Instant::now();
        let mut socket = TcpStream::connect((host, port))?;
        socket.set_nodelay(true)?;
        if !options.read_timeout.is_zero() {
            socket.set_read_timeout(Some(options.read_timeout))?;
        }
        let ip = socket.peer_addr()?.ip();
        socket.write_all(&request_bytes)?;

        // Spool the raw response to a temporary file, digesting as we go.
        let mut spool = tempfile::tempfile()?;
        let mut response_digest = digester(DIGEST_ALGORITHM)?;
        let mut received: u64 = 0;
        let mut truncated = TruncationReason::NotTruncated;
        let mut buf = [0u8; 8192];
        loop {
            if options.max_length > 0 && received >= options.max_length {
                truncated = TruncationReason::Length;
                break;
            }
            if let Some(max_time) = options.max_time {
                if started.elapsed() >= max_time {
                    truncated = TruncationReason::Time;
                    break;
                }
            }
            // Never read past the length limit: the spool, digest and
            // Content-Length must cover only the retained bytes.
            let limit = if options.max_length > 0 {
                buf.len().min((options.max_length - received) as usize)
            } else {
                buf.len()
            };
            let n = socket.read(&mut buf[..limit])?;
            if n == 0 {
                break;
            }
            spool.write_all(&buf[..n])?;
            response_digest.update(&buf[..n]);
            received += n as u64;
        }
        drop(socket);
        debug!(%uri, bytes = received, "fetched");

        spool.seek(SeekFrom::Start(0))?;
        let payload_digest = payload_digest(&spool);
        spool.seek(SeekFrom::Start(0))?;

        let mut builder = WarcBuilder::new(WarcType::Response);
        builder
            .target_uri(uri.as_str())
            .date(date)
            .ip_address(ip)
            .block_digest(&WarcDigest::from_digester(DIGEST_ALGORITHM, response_digest))
            .truncated(truncated)
            .stream_body(
                "application/http;msgtype=response",
                Box::new(spool),
                received,
            );
        if let Some(digest) = payload_digest {
            builder.payload_digest(&digest);
        }
        let mut response = builder.build()?;
        self.write(&mut response)?;

        let mut builder = WarcBuilder::new(WarcType::Request);
        builder
            .target_uri(uri.as_str())
            .date(date)
            .block_digest(&WarcDigest::from_digester(DIGEST_ALGORITHM, request_digest))
            .body("application/http;msgtype=request", request_bytes);
        if let Some(id) = response.id() {
            builder.concurrent_to(&id);
        }
        let mut request = builder.build()?;
        self.write(&mut request)?;

        Ok(FetchResult { response, request })
    }

    /// Flushes and returns the underlying sink.
    pub fn into_inner(mut self) -> Result<W> {
        self.sink.flush()?;
        match self.sink {
            Sink::Plain(w) => Ok(w),
            Sink::Gzip(gz) => Ok(gz.into_inner()),
        }
    }
}

/// Digest of the HTTP response payload, or `None` when the response does
/// not parse as HTTP or the payload is empty.
fn payload_digest(spool: &std::fs::File) -> Option<WarcDigest> {
    let mut reader = io::BufReader::new(spool);
    let response = match HttpResponse::parse(&mut reader) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "response not parsable as HTTP, skipping payload digest");
            return None;
        }
    };
    let mut body = http_body(response.headers(), reader);
    let mut hasher = digester(DIGEST_ALGORITHM).ok()?;
    let mut buf = [0u8; 8192];
    let mut length: u64 = 0;
    loop {
        match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                hasher.update(&buf[..n]);
                length += n as u64;
            }
            Err(_) => return None,
        }
    }
    if length == 0 {
        return None;
    }
    Some(WarcDigest::from_digester(DIGEST_ALGORITHM, hasher))
}

// ── Fetch configuration ───────────────────────────────────────────────────────

/// Limits and settings for [`WarcWriter::fetch`].
pub struct FetchOptions {
    max_length: u64,
    max_time: Option<Duration>,
    read_timeout: Duration,
    user_agent: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            max_length: 0,
            max_time: None,
            read_timeout: Duration::from_secs(60),
            user_agent: "warckit".to_string(),
        }
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops the fetch after this many raw bytes, protocol headers
    /// included, and marks the response `WARC-Truncated: length`.
    pub fn max_length(mut self, bytes: u64) -> Self {
        self.max_length = bytes;
        self
    }

    /// Stops the fetch after this long and marks the response
    /// `WARC-Truncated: time`.
    pub fn max_time(mut self, limit: Duration) -> Self {
        self.max_time = Some(limit);
        self
    }

    /// Socket read timeout. Zero disables it. Default one minute.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// The records written by a fetch, with their bodies already consumed.
/// Useful for the ids, digests and truncation status.
pub struct FetchResult {
    pub response: WarcRecord<OwnedBody>,
    pub request: WarcRecord<OwnedBody>,
}
