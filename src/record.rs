//! The WARC record model.
//!
//! A record is a protocol version, an ordered header map and a body. There
//! is deliberately no struct-per-record-type hierarchy: every record is a
//! [`WarcRecord`] and the typed accessors parse the relevant header field
//! on access, so fields added by other tools survive a read-modify-write
//! cycle untouched.
//!
//! # Angle brackets
//!
//! The WARC standard writes record ids as `<urn:uuid:...>` but target URIs
//! bare. Files exist with both conventions on both fields, so URI-valued
//! accessors accept either form; serialization in the writer emits the
//! standard one.

use std::io::{self, Cursor, Read};
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::body::MessageBody;
use crate::digest::WarcDigest;
use crate::headers::{HeaderName, MessageHeaders, MessageVersion};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Missing mandatory field for {warc_type} record: {field}")]
    MissingField {
        warc_type: String,
        field: &'static str,
    },
}

// ── Record types ──────────────────────────────────────────────────────────────

/// The value of the `WARC-Type` field. Unrecognized types are preserved,
/// as the standard requires readers to skip rather than reject them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WarcType {
    Warcinfo,
    Response,
    Resource,
    Request,
    Metadata,
    Revisit,
    Conversion,
    Continuation,
    Other(String),
}

impl WarcType {
    pub fn as_str(&self) -> &str {
        match self {
            WarcType::Warcinfo => "warcinfo",
            WarcType::Response => "response",
            WarcType::Resource => "resource",
            WarcType::Request => "request",
            WarcType::Metadata => "metadata",
            WarcType::Revisit => "revisit",
            WarcType::Conversion => "conversion",
            WarcType::Continuation => "continuation",
            WarcType::Other(s) => s,
        }
    }

    pub fn from_name(name: &str) -> WarcType {
        match name {
            "warcinfo" => WarcType::Warcinfo,
            "response" => WarcType::Response,
            "resource" => WarcType::Resource,
            "request" => WarcType::Request,
            "metadata" => WarcType::Metadata,
            "revisit" => WarcType::Revisit,
            "conversion" => WarcType::Conversion,
            "continuation" => WarcType::Continuation,
            other => WarcType::Other(other.to_string()),
        }
    }

    /// Whether records of this type participate in a capture: everything
    /// except warcinfo, conversion and continuation.
    pub fn is_capture_member(&self) -> bool {
        !matches!(
            self,
            WarcType::Warcinfo | WarcType::Conversion | WarcType::Continuation
        )
    }

    /// Whether this type is the main record of a capture.
    pub fn is_capture_main(&self) -> bool {
        matches!(
            self,
            WarcType::Response | WarcType::Resource | WarcType::Revisit
        )
    }
}

impl std::fmt::Display for WarcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The value of the `WARC-Truncated` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationReason {
    NotTruncated,
    Length,
    Time,
    Disconnect,
    Unspecified,
}

impl TruncationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TruncationReason::NotTruncated => "",
            TruncationReason::Length => "length",
            TruncationReason::Time => "time",
            TruncationReason::Disconnect => "disconnect",
            TruncationReason::Unspecified => "unspecified",
        }
    }

    pub fn from_name(name: &str) -> TruncationReason {
        match name.to_ascii_lowercase().as_str() {
            "length" => TruncationReason::Length,
            "time" => TruncationReason::Time,
            "disconnect" => TruncationReason::Disconnect,
            _ => TruncationReason::Unspecified,
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// A single record: version, headers and a body of any framing.
#[derive(Debug)]
pub struct WarcRecord<B> {
    version: MessageVersion,
    headers: MessageHeaders,
    body: B,
}

fn strip_brackets(value: &str) -> &str {
    value
        .strip_prefix('<')
        .and_then(|v| v.strip_suffix('>'))
        .unwrap_or(value)
}

fn parse_uri(value: &str) -> Option<Url> {
    Url::parse(strip_brackets(value)).ok()
}

impl<B> WarcRecord<B> {
    pub fn new(version: MessageVersion, headers: MessageHeaders, body: B) -> Self {
        WarcRecord {
            version,
            headers,
            body,
        }
    }

    pub fn version(&self) -> MessageVersion {
        self.version
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut MessageHeaders {
        &mut self.headers
    }

    pub fn body(&self) -> &B {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut B {
        &mut self.body
    }

    pub fn into_body(self) -> B {
        self.body
    }

    /// Replaces the body, keeping version and headers. The `Content-Length`
    /// header is not touched.
    pub fn map_body<C>(self, f: impl FnOnce(B) -> C) -> WarcRecord<C> {
        WarcRecord {
            version: self.version,
            headers: self.headers,
            body: f(self.body),
        }
    }

    pub fn warc_type(&self) -> WarcType {
        WarcType::from_name(self.headers.first("WARC-Type").unwrap_or("default"))
    }

    pub fn content_length(&self) -> u64 {
        self.headers
            .first("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.first("Content-Type")
    }

    pub fn id(&self) -> Option<Url> {
        self.headers.first("WARC-Record-ID").and_then(parse_uri)
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.headers
            .first("WARC-Date")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    pub fn target_uri(&self) -> Option<&str> {
        self.headers.first("WARC-Target-URI").map(strip_brackets)
    }

    pub fn concurrent_to(&self) -> Vec<Url> {
        self.headers
            .all("WARC-Concurrent-To")
            .into_iter()
            .filter_map(parse_uri)
            .collect()
    }

    pub fn refers_to(&self) -> Option<Url> {
        self.headers.first("WARC-Refers-To").and_then(parse_uri)
    }

    pub fn warcinfo_id(&self) -> Option<Url> {
        self.headers.first("WARC-Warcinfo-ID").and_then(parse_uri)
    }

    pub fn block_digest(&self) -> Option<WarcDigest> {
        self.headers
            .first("WARC-Block-Digest")
            .and_then(|v| WarcDigest::from_str(v).ok())
    }

    pub fn payload_digest(&self) -> Option<WarcDigest> {
        self.headers
            .first("WARC-Payload-Digest")
            .and_then(|v| WarcDigest::from_str(v).ok())
    }

    pub fn identified_payload_type(&self) -> Option<&str> {
        self.headers.first("WARC-Identified-Payload-Type")
    }

    pub fn ip_address(&self) -> Option<IpAddr> {
        self.headers
            .first("WARC-IP-Address")
            .and_then(|v| v.parse().ok())
    }

    /// The `WARC-Filename` of a warcinfo record.
    pub fn filename(&self) -> Option<&str> {
        self.headers.first("WARC-Filename")
    }

    /// The `WARC-Profile` of a revisit record. Early writers wrapped this
    /// in angle brackets; both forms are accepted.
    pub fn profile(&self) -> Option<&str> {
        self.headers.first("WARC-Profile").map(strip_brackets)
    }

    pub fn segment_number(&self) -> Option<u64> {
        self.headers
            .first("WARC-Segment-Number")
            .and_then(|v| v.parse().ok())
    }

    pub fn segment_origin_id(&self) -> Option<Url> {
        self.headers
            .first("WARC-Segment-Origin-ID")
            .and_then(parse_uri)
    }

    pub fn segment_total_length(&self) -> Option<u64> {
        self.headers
            .first("WARC-Segment-Total-Length")
            .and_then(|v| v.parse().ok())
    }

    pub fn truncated(&self) -> TruncationReason {
        match self.headers.first("WARC-Truncated") {
            Some(reason) => TruncationReason::from_name(reason),
            None => TruncationReason::NotTruncated,
        }
    }
}

impl<B: Read> WarcRecord<B> {
    /// Reads the whole remaining body into memory, replacing the framing
    /// with an [`OwnedBody`].
    pub fn into_owned(mut self) -> io::Result<WarcRecord<OwnedBody>> {
        let mut bytes = Vec::new();
        self.body.read_to_end(&mut bytes)?;
        Ok(WarcRecord {
            version: self.version,
            headers: self.headers,
            body: OwnedBody::from_bytes(bytes),
        })
    }
}

// ── Owned bodies ──────────────────────────────────────────────────────────────

/// A body the record owns: either in-memory bytes or a boxed stream with a
/// declared size.
pub enum OwnedBody {
    Bytes(Cursor<Vec<u8>>),
    Stream {
        reader: Box<dyn Read>,
        size: u64,
        position: u64,
    },
}

impl OwnedBody {
    pub fn empty() -> Self {
        OwnedBody::Bytes(Cursor::new(Vec::new()))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        OwnedBody::Bytes(Cursor::new(bytes))
    }

    pub fn from_stream(reader: Box<dyn Read>, size: u64) -> Self {
        OwnedBody::Stream {
            reader,
            size,
            position: 0,
        }
    }

    /// The underlying bytes, when the body is held in memory.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            OwnedBody::Bytes(cursor) => Some(cursor.get_ref()),
            OwnedBody::Stream { .. } => None,
        }
    }
}

impl std::fmt::Debug for OwnedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OwnedBody::Bytes(cursor) => {
                write!(f, "OwnedBody::Bytes({} bytes)", cursor.get_ref().len())
            }
            OwnedBody::Stream { size, .. } => write!(f, "OwnedBody::Stream({} bytes)", size),
        }
    }
}

impl Read for OwnedBody {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match self {
            OwnedBody::Bytes(cursor) => cursor.read(dst),
            OwnedBody::Stream {
                reader, position, ..
            } => {
                let n = reader.read(dst)?;
                *position += n as u64;
                Ok(n)
            }
        }
    }
}

impl MessageBody for OwnedBody {
    fn size(&self) -> Option<u64> {
        match self {
            OwnedBody::Bytes(cursor) => Some(cursor.get_ref().len() as u64),
            OwnedBody::Stream { size, .. } => Some(*size),
        }
    }

    fn position(&self) -> u64 {
        match self {
            OwnedBody::Bytes(cursor) => cursor.position(),
            OwnedBody::Stream { position, .. } => *position,
        }
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Staging builder for new records.
///
/// `new` seeds the headers every record needs: the type, a fresh
/// `urn:uuid` record id, the current date and a zero `Content-Length`.
/// The builder is reusable; `build` clones the staged headers and takes
/// the staged body.
pub struct WarcBuilder {
    version: MessageVersion,
    warc_type: WarcType,
    headers: MessageHeaders,
    body: Option<OwnedBody>,
}

impl WarcBuilder {
    pub fn new(warc_type: WarcType) -> Self {
        let mut headers = MessageHeaders::new();
        headers.set(
            HeaderName::new_unchecked("WARC-Type"),
            warc_type.as_str().to_string(),
        );
        headers.set(
            HeaderName::new_unchecked("WARC-Record-ID"),
            format!("<urn:uuid:{}>", Uuid::new_v4()),
        );
        headers.set(HeaderName::new_unchecked("Content-Length"), "0");
        let mut builder = WarcBuilder {
            version: MessageVersion::WARC_1_1,
            warc_type,
            headers,
            body: None,
        };
        builder.date(Utc::now());
        builder
    }

    /// Sets the record version. The staged `WARC-Date` is re-formatted at
    /// the precision the new version allows.
    pub fn version(&mut self, version: MessageVersion) -> &mut Self {
        self.version = version;
        let staged = self
            .headers
            .first("WARC-Date")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|d| d.with_timezone(&Utc));
        if let Some(date) = staged {
            self.date(date);
        }
        self
    }

    /// Sets an arbitrary field, replacing existing values.
    pub fn header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.set(HeaderName::new_unchecked(name), value);
        self
    }

    /// Adds a value to a repeatable field.
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.append(HeaderName::new_unchecked(name), value);
        self
    }

    /// Removes every value of a field, including builder-seeded ones.
    pub fn unset(&mut self, name: &str) -> &mut Self {
        self.headers.remove(name);
        self
    }

    pub fn record_id(&mut self, id: &Url) -> &mut Self {
        self.header("WARC-Record-ID", format!("<{}>", id))
    }

    pub fn date(&mut self, date: DateTime<Utc>) -> &mut Self {
        // WARC 1.0 allows only second precision.
        let format = if self.version == MessageVersion::WARC_1_0 {
            SecondsFormat::Secs
        } else {
            SecondsFormat::AutoSi
        };
        self.header("WARC-Date", date.to_rfc3339_opts(format, true))
    }

    pub fn target_uri(&mut self, uri: impl Into<String>) -> &mut Self {
        self.header("WARC-Target-URI", uri.into())
    }

    pub fn concurrent_to(&mut self, id: &Url) -> &mut Self {
        self.add_header("WARC-Concurrent-To", format!("<{}>", id))
    }

    pub fn refers_to(&mut self, id: &Url) -> &mut Self {
        self.header("WARC-Refers-To", format!("<{}>", id))
    }

    pub fn warcinfo_id(&mut self, id: &Url) -> &mut Self {
        self.header("WARC-Warcinfo-ID", format!("<{}>", id))
    }

    pub fn ip_address(&mut self, addr: IpAddr) -> &mut Self {
        self.header("WARC-IP-Address", addr.to_string())
    }

    pub fn filename(&mut self, filename: impl Into<String>) -> &mut Self {
        self.header("WARC-Filename", filename.into())
    }

    pub fn profile(&mut self, profile: impl Into<String>) -> &mut Self {
        self.header("WARC-Profile", profile.into())
    }

    pub fn identified_payload_type(&mut self, media_type: impl Into<String>) -> &mut Self {
        self.header("WARC-Identified-Payload-Type", media_type.into())
    }

    pub fn block_digest(&mut self, digest: &WarcDigest) -> &mut Self {
        self.header("WARC-Block-Digest", digest.to_string())
    }

    pub fn payload_digest(&mut self, digest: &WarcDigest) -> &mut Self {
        self.header("WARC-Payload-Digest", digest.to_string())
    }

    /// Sets the truncation reason; `NotTruncated` removes the field.
    pub fn truncated(&mut self, reason: TruncationReason) -> &mut Self {
        match reason {
            TruncationReason::NotTruncated => self.unset("WARC-Truncated"),
            other => self.header("WARC-Truncated", other.as_str()),
        }
    }

    pub fn segment_number(&mut self, number: u64) -> &mut Self {
        self.header("WARC-Segment-Number", number.to_string())
    }

    pub fn segment_origin_id(&mut self, id: &Url) -> &mut Self {
        self.header("WARC-Segment-Origin-ID", format!("<{}>", id))
    }

    pub fn segment_total_length(&mut self, length: u64) -> &mut Self {
        self.header("WARC-Segment-Total-Length", length.to_string())
    }

    /// Stages an in-memory body, setting `Content-Type` and
    /// `Content-Length` to match.
    pub fn body(&mut self, content_type: &str, bytes: Vec<u8>) -> &mut Self {
        self.header("Content-Type", content_type);
        self.header("Content-Length", bytes.len().to_string());
        self.body = Some(OwnedBody::from_bytes(bytes));
        self
    }

    /// Stages a streamed body of known size.
    pub fn stream_body(
        &mut self,
        content_type: &str,
        reader: Box<dyn Read>,
        size: u64,
    ) -> &mut Self {
        self.header("Content-Type", content_type);
        self.header("Content-Length", size.to_string());
        self.body = Some(OwnedBody::from_stream(reader, size));
        self
    }

    fn require(&self, field: &'static str) -> Result<(), BuildError> {
        if self.headers.first(field).is_none() {
            return Err(BuildError::MissingField {
                warc_type: self.warc_type.as_str().to_string(),
                field,
            });
        }
        Ok(())
    }

    pub fn build(&mut self) -> Result<WarcRecord<OwnedBody>, BuildError> {
        match self.warc_type {
            WarcType::Response
            | WarcType::Resource
            | WarcType::Request
            | WarcType::Revisit
            | WarcType::Conversion
            | WarcType::Continuation => self.require("WARC-Target-URI")?,
            _ => {}
        }
        if self.warc_type == WarcType::Revisit {
            self.require("WARC-Profile")?;
        }
        if self.warc_type == WarcType::Continuation {
            self.require("WARC-Segment-Origin-ID")?;
            self.require("WARC-Segment-Number")?;
        }
        let body = self.body.take().unwrap_or_else(OwnedBody::empty);
        Ok(WarcRecord {
            version: self.version,
            headers: self.headers.clone(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_seeds_required_fields() {
        let record = WarcBuilder::new(WarcType::Warcinfo).build().unwrap();
        assert_eq!(record.warc_type(), WarcType::Warcinfo);
        assert_eq!(record.content_length(), 0);
        let id = record.id().unwrap();
        assert_eq!(id.scheme(), "urn");
        assert!(record.date().is_some());
        // Record ids serialize in angle brackets.
        assert!(record.headers().first("WARC-Record-ID").unwrap().starts_with('<'));
    }

    #[test]
    fn builder_requires_target_uri() {
        let err = WarcBuilder::new(WarcType::Response).build().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing mandatory field for response record: WARC-Target-URI"
        );
        assert!(WarcBuilder::new(WarcType::Response)
            .target_uri("http://example.org/")
            .build()
            .is_ok());
    }

    #[test]
    fn revisit_requires_profile() {
        let mut builder = WarcBuilder::new(WarcType::Revisit);
        builder.target_uri("http://example.org/");
        assert!(builder.build().is_err());
        builder.profile("http://netpreserve.org/warc/1.1/revisit/identical-payload-digest");
        assert!(builder.build().is_ok());
    }

    #[test]
    fn downgrading_version_drops_subsecond_date() {
        let date = DateTime::parse_from_rfc3339("2016-09-19T17:20:24.123Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut builder = WarcBuilder::new(WarcType::Warcinfo);
        builder.date(date);
        assert_eq!(
            builder.headers.first("WARC-Date"),
            Some("2016-09-19T17:20:24.123Z")
        );
        builder.version(MessageVersion::WARC_1_0);
        let record = builder.build().unwrap();
        assert_eq!(
            record.headers().first("WARC-Date"),
            Some("2016-09-19T17:20:24Z")
        );
    }

    #[test]
    fn not_truncated_removes_header() {
        let mut builder = WarcBuilder::new(WarcType::Response);
        builder
            .target_uri("http://example.org/")
            .truncated(TruncationReason::Disconnect)
            .truncated(TruncationReason::NotTruncated);
        let record = builder.build().unwrap();
        assert!(record.headers().first("WARC-Truncated").is_none());
        assert_eq!(record.truncated(), TruncationReason::NotTruncated);
    }

    #[test]
    fn body_sets_length_and_type() {
        let mut builder = WarcBuilder::new(WarcType::Resource);
        builder
            .target_uri("http://example.org/hello.txt")
            .body("text/plain", b"hello".to_vec());
        let mut record = builder.build().unwrap();
        assert_eq!(record.content_length(), 5);
        assert_eq!(record.content_type(), Some("text/plain"));
        let mut bytes = Vec::new();
        record.body_mut().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"hello");
        assert!(record.body().is_consumed());
    }

    #[test]
    fn accessors_strip_angle_brackets() {
        let mut headers = MessageHeaders::new();
        headers.append(
            HeaderName::new("WARC-Target-URI").unwrap(),
            "<http://example.org/>",
        );
        headers.append(
            HeaderName::new("WARC-Record-ID").unwrap(),
            "<urn:uuid:92283950-ef2f-4d72-b224-f54c6ec90bb0>",
        );
        headers.append(HeaderName::new("WARC-Profile").unwrap(), "<http://p/>");
        let record = WarcRecord::new(MessageVersion::WARC_1_1, headers, OwnedBody::empty());
        assert_eq!(record.target_uri(), Some("http://example.org/"));
        assert_eq!(record.profile(), Some("http://p/"));
        assert_eq!(
            record.id().unwrap().as_str(),
            "urn:uuid:92283950-ef2f-4d72-b224-f54c6ec90bb0"
        );
    }

    #[test]
    fn typed_accessors_parse_header_values() {
        let mut headers = MessageHeaders::new();
        headers.append(
            HeaderName::new("WARC-Date").unwrap(),
            "2016-09-19T17:20:24Z",
        );
        headers.append(HeaderName::new("WARC-IP-Address").unwrap(), "207.241.233.58");
        headers.append(
            HeaderName::new("WARC-Block-Digest").unwrap(),
            "sha1:UZY6ND6CCHXETFVJD2MSS7ZENMWF7KQ2",
        );
        headers.append(HeaderName::new("WARC-Truncated").unwrap(), "disconnect");
        headers.append(HeaderName::new("WARC-Segment-Number").unwrap(), "2");
        let record = WarcRecord::new(MessageVersion::WARC_1_1, headers, OwnedBody::empty());
        assert_eq!(
            record.date().unwrap().to_rfc3339_opts(SecondsFormat::Secs, true),
            "2016-09-19T17:20:24Z"
        );
        assert_eq!(record.ip_address().unwrap().to_string(), "207.241.233.58");
        assert_eq!(record.block_digest().unwrap().algorithm(), "sha1");
        assert_eq!(record.truncated(), TruncationReason::Disconnect);
        assert_eq!(record.segment_number(), Some(2));
    }

    #[test]
    fn builder_is_reusable() {
        let mut builder = WarcBuilder::new(WarcType::Metadata);
        builder.body("application/warc-fields", b"a: 1\r\n".to_vec());
        let first = builder.build().unwrap();
        let second = builder.build().unwrap();
        assert_eq!(first.id(), second.id());
        // The staged body is consumed by the first build.
        assert_eq!(first.body().size(), Some(6));
        assert_eq!(second.body().size(), Some(0));
    }
}
