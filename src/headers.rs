//! Protocol header primitives shared by WARC, ARC and HTTP messages.
//!
//! # Field names
//!
//! A [`HeaderName`] is a validated token: visible ASCII excluding the
//! separator characters `()<>@,;:\"/[]?={}` and whitespace. Names compare
//! and hash case-insensitively while preserving the spelling they were
//! created with.
//!
//! # Header maps
//!
//! [`MessageHeaders`] keeps fields in insertion order and permits repeated
//! names, because both WARC and HTTP do. `first`/`all`/`sole` are the read
//! operations; `sole` fails when a field the format requires to be unique
//! appears more than once.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, Write};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Invalid header field name: {0:?}")]
    InvalidName(String),
    #[error("Field must not be repeated: {0}")]
    Repeated(String),
}

const SEPARATORS: &[u8] = b"()<>@,;:\\\"/[]?={} \t";

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_graphic() && !SEPARATORS.contains(&b)
}

// ── Field names ───────────────────────────────────────────────────────────────

/// A validated header field name with case-insensitive identity.
#[derive(Debug, Clone)]
pub struct HeaderName(String);

impl HeaderName {
    pub fn new(name: impl Into<String>) -> Result<Self, HeaderError> {
        let name = name.into();
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(HeaderError::InvalidName(name));
        }
        Ok(HeaderName(name))
    }

    /// For names the caller already knows are well formed, or that lenient
    /// parsing chose to accept anyway.
    pub(crate) fn new_unchecked(name: impl Into<String>) -> Self {
        HeaderName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for HeaderName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for HeaderName {}

impl PartialEq<str> for HeaderName {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl Hash for HeaderName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Header maps ───────────────────────────────────────────────────────────────

/// An insertion-ordered multimap of header fields.
#[derive(Debug, Clone, Default)]
pub struct MessageHeaders {
    fields: Vec<(HeaderName, String)>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The first value of the named field, if present.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values of the named field, in insertion order.
    pub fn all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// The value of a field that must not be repeated.
    pub fn sole(&self, name: &str) -> Result<Option<&str>, HeaderError> {
        let mut it = self.fields.iter().filter(|(n, _)| n == name);
        let first = it.next();
        if it.next().is_some() {
            return Err(HeaderError::Repeated(name.to_string()));
        }
        Ok(first.map(|(_, v)| v.as_str()))
    }

    /// Whether any value of the named field contains `token` as a member of
    /// its comma-separated list, compared case-insensitively. Used for
    /// headers like `Transfer-Encoding: gzip, chunked`.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.all(name)
            .iter()
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Appends a field, keeping any existing values of the same name.
    pub fn append(&mut self, name: HeaderName, value: impl Into<String>) {
        self.fields.push((name, value.into()));
    }

    /// Replaces every value of the named field with a single value. The new
    /// value takes the position of the first old one, or the end.
    pub fn set(&mut self, name: HeaderName, value: impl Into<String>) {
        let value = value.into();
        let mut slot = None;
        let mut i = 0;
        while i < self.fields.len() {
            if self.fields[i].0 == name {
                if slot.is_none() {
                    slot = Some(i);
                    i += 1;
                } else {
                    self.fields.remove(i);
                }
            } else {
                i += 1;
            }
        }
        match slot {
            Some(i) => self.fields[i] = (name, value),
            None => self.fields.push((name, value)),
        }
    }

    /// Removes every value of the named field.
    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(n, _)| n != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &str)> {
        self.fields.iter().map(|(n, v)| (n, v.as_str()))
    }

    /// Serializes the fields as `Name: value\r\n` lines, without the blank
    /// line that terminates a header block.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for (name, value) in &self.fields {
            write!(writer, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}

// ── Protocol versions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Warc,
    Arc,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Warc => "WARC",
            Protocol::Arc => "ARC",
            Protocol::Http => "HTTP",
        }
    }
}

/// A protocol name with a major and minor version, e.g. `WARC/1.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageVersion {
    pub protocol: Protocol,
    pub major: u32,
    pub minor: u32,
}

impl MessageVersion {
    pub const WARC_1_0: MessageVersion = MessageVersion::new(Protocol::Warc, 1, 0);
    pub const WARC_1_1: MessageVersion = MessageVersion::new(Protocol::Warc, 1, 1);
    /// Version reported for records synthesized from ARC files.
    pub const ARC_1_1: MessageVersion = MessageVersion::new(Protocol::Arc, 1, 1);
    pub const HTTP_1_0: MessageVersion = MessageVersion::new(Protocol::Http, 1, 0);
    pub const HTTP_1_1: MessageVersion = MessageVersion::new(Protocol::Http, 1, 1);

    pub const fn new(protocol: Protocol, major: u32, minor: u32) -> Self {
        MessageVersion {
            protocol,
            major,
            minor,
        }
    }
}

impl fmt::Display for MessageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.protocol.as_str(), self.major, self.minor)
    }
}
