//! Incremental header parser for WARC records, warc-fields blocks and
//! legacy ARC url-record lines.
//!
//! # Design
//!
//! [`HeaderParser`] is a restartable, byte-at-a-time state machine. Callers
//! push input with [`HeaderParser::update`]; the parser consumes bytes up to
//! and including the blank line that terminates the header block and leaves
//! the rest untouched, so the same buffer can then be handed to the body
//! decoder. `reset()` returns the machine to its entry state for the next
//! record without reallocating.
//!
//! # ARC compatibility
//!
//! The entry state sniffs the first byte: `W` begins a `WARC/x.y` version
//! line, a lowercase letter begins a space-separated ARC url-record line
//! (`url ip date content-type length`). ARC records surface as synthesized
//! WARC headers under version `ARC/1.1`:
//!
//! | URL scheme      | WARC-Type | Content-Type                         |
//! |-----------------|-----------|--------------------------------------|
//! | `filedesc://`   | warcinfo  | `text/plain` (plus `WARC-Filename`)  |
//! | `dns:`          | response  | `text/dns`                           |
//! | anything else   | response  | `application/http;msgtype=response`  |
//!
//! # Leniency
//!
//! The strict machine demands CRLF line endings and token-clean field names.
//! [`HeaderParser::set_lenient`] relaxes this for material seen in the wild:
//! bare LF line endings and control characters in names and values are
//! accepted with a logged warning.

use chrono::{NaiveDateTime, TimeZone, Utc};
use thiserror::Error;
use tracing::warn;

use crate::headers::{HeaderName, MessageHeaders, MessageVersion};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid record at position {position}: {context:?}")]
    Invalid { position: u64, context: String },
    #[error("record truncated at position {position}")]
    Truncated { position: u64 },
}

const INITIAL_BUF: usize = 256;
const MAX_RETAINED_BUF: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Entry,
    VersionLiteral { index: usize },
    VersionMajor { empty: bool },
    VersionMinor { empty: bool },
    VersionCr,
    FieldStart,
    FieldName,
    ValueStart,
    Value,
    ValueCr,
    FoldStart,
    EndCr,
    ArcUrl,
    ArcIp,
    ArcDate,
    ArcMime,
    ArcLength { empty: bool },
    Done,
}

/// Restartable push parser for one header block.
pub struct HeaderParser {
    state: State,
    entry: State,
    lenient: bool,
    buf: Vec<u8>,
    name: Option<HeaderName>,
    value: Vec<u8>,
    end_of_text: usize,
    headers: MessageHeaders,
    version: MessageVersion,
    major: u32,
    minor: u32,
    position: u64,
}

impl HeaderParser {
    /// A parser expecting a full record header: version line then fields.
    pub fn new() -> Self {
        Self::with_entry(State::Entry)
    }

    /// A parser for an `application/warc-fields` body: fields only, no
    /// version line, terminated by end of input rather than a blank line.
    pub fn warc_fields() -> Self {
        Self::with_entry(State::FieldStart)
    }

    fn with_entry(entry: State) -> Self {
        HeaderParser {
            state: entry,
            entry,
            lenient: false,
            buf: Vec::with_capacity(INITIAL_BUF),
            name: None,
            value: Vec::new(),
            end_of_text: 0,
            headers: MessageHeaders::new(),
            version: MessageVersion::WARC_1_0,
            major: 0,
            minor: 0,
            position: 0,
        }
    }

    pub fn set_lenient(&mut self, lenient: bool) {
        self.lenient = lenient;
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Done
    }

    /// Bytes consumed since the last reset; once finished this is the
    /// serialized length of the header block.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn version(&self) -> MessageVersion {
        self.version
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn take_headers(&mut self) -> MessageHeaders {
        std::mem::take(&mut self.headers)
    }

    /// Returns the parser to its entry state. The scratch buffers are kept
    /// unless they have grown past 4096 bytes, in which case they are shed
    /// back to a small default.
    pub fn reset(&mut self) {
        self.state = self.entry;
        self.name = None;
        if self.value.capacity() > MAX_RETAINED_BUF {
            self.value = Vec::new();
        } else {
            self.value.clear();
        }
        self.end_of_text = 0;
        self.headers = MessageHeaders::new();
        self.version = MessageVersion::WARC_1_0;
        self.major = 0;
        self.minor = 0;
        self.position = 0;
        if self.buf.capacity() > MAX_RETAINED_BUF {
            self.buf = Vec::with_capacity(INITIAL_BUF);
        } else {
            self.buf.clear();
        }
    }

    /// Feeds bytes to the machine, returning how many were consumed.
    /// Consumption stops at the end of the header block; the caller owns
    /// whatever follows.
    pub fn update(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        let mut i = 0;
        while i < data.len() && self.state != State::Done {
            let b = data[i];
            self.step(b, &data[i..])?;
            i += 1;
            self.position += 1;
        }
        Ok(i)
    }

    /// Ends the input. Valid only for warc-fields parsing, where the block
    /// is terminated by end of input instead of a blank line.
    pub fn finish(&mut self) -> Result<(), ParseError> {
        match self.state {
            State::Done => Ok(()),
            State::FieldStart if self.entry == State::FieldStart => {
                self.commit_field()?;
                self.state = State::Done;
                Ok(())
            }
            _ => Err(self.invalid(&[])),
        }
    }

    fn invalid(&self, rest: &[u8]) -> ParseError {
        let context = String::from_utf8_lossy(&rest[..rest.len().min(40)]).into_owned();
        ParseError::Invalid {
            position: self.position,
            context,
        }
    }

    fn commit_field(&mut self) -> Result<(), ParseError> {
        if let Some(name) = self.name.take() {
            self.value.truncate(self.end_of_text);
            let value = String::from_utf8_lossy(&self.value).into_owned();
            self.headers.append(name, value);
            self.value.clear();
            self.end_of_text = 0;
        }
        Ok(())
    }

    fn start_field(&mut self, rest: &[u8]) -> Result<(), ParseError> {
        let raw = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&raw).into_owned();
        self.buf = raw;
        self.buf.clear();
        let name = if self.lenient {
            HeaderName::new_unchecked(text)
        } else {
            HeaderName::new(text).map_err(|_| self.invalid(rest))?
        };
        self.name = Some(name);
        Ok(())
    }

    fn push_value(&mut self, b: u8) {
        self.value.push(b);
        if b != b' ' && b != b'\t' {
            self.end_of_text = self.value.len();
        }
    }

    fn step(&mut self, b: u8, rest: &[u8]) -> Result<(), ParseError> {
        match self.state {
            State::Entry => match b {
                b'W' => self.state = State::VersionLiteral { index: 1 },
                b'a'..=b'z' => {
                    self.buf.clear();
                    self.buf.push(b);
                    self.state = State::ArcUrl;
                }
                _ => return Err(self.invalid(rest)),
            },

            State::VersionLiteral { index } => {
                if b"WARC/"[index] == b {
                    self.state = if index + 1 == 5 {
                        State::VersionMajor { empty: true }
                    } else {
                        State::VersionLiteral { index: index + 1 }
                    };
                } else {
                    return Err(self.invalid(rest));
                }
            }
            State::VersionMajor { empty } => match b {
                b'0'..=b'9' => {
                    self.major = self.major * 10 + u32::from(b - b'0');
                    self.state = State::VersionMajor { empty: false };
                }
                b'.' if !empty => self.state = State::VersionMinor { empty: true },
                _ => return Err(self.invalid(rest)),
            },
            State::VersionMinor { empty } => match b {
                b'0'..=b'9' => {
                    self.minor = self.minor * 10 + u32::from(b - b'0');
                    self.state = State::VersionMinor { empty: false };
                }
                b'\r' if !empty => self.state = State::VersionCr,
                b'\n' if !empty && self.lenient => {
                    warn!("bare LF terminating version line");
                    self.finish_version();
                    self.state = State::FieldStart;
                }
                _ => return Err(self.invalid(rest)),
            },
            State::VersionCr => {
                if b == b'\n' {
                    self.finish_version();
                    self.state = State::FieldStart;
                } else {
                    return Err(self.invalid(rest));
                }
            }

            State::FieldStart => match b {
                b'\r' => {
                    self.commit_field()?;
                    self.state = State::EndCr;
                }
                b'\n' if self.lenient => {
                    warn!("bare LF terminating header block");
                    self.commit_field()?;
                    self.state = State::Done;
                }
                b' ' | b'\t' => {
                    if self.name.is_none() {
                        return Err(self.invalid(rest));
                    }
                    self.state = State::FoldStart;
                }
                _ if is_name_byte(b, self.lenient) => {
                    self.commit_field()?;
                    self.buf.clear();
                    self.buf.push(b);
                    self.state = State::FieldName;
                }
                _ => return Err(self.invalid(rest)),
            },
            State::FieldName => match b {
                b':' => {
                    self.start_field(rest)?;
                    self.state = State::ValueStart;
                }
                _ if is_name_byte(b, self.lenient) => self.buf.push(b),
                _ => return Err(self.invalid(rest)),
            },
            State::ValueStart => match b {
                b' ' | b'\t' => {}
                b'\r' => self.state = State::ValueCr,
                b'\n' if self.lenient => self.state = State::FieldStart,
                _ if is_value_byte(b, self.lenient) => {
                    self.push_value(b);
                    self.state = State::Value;
                }
                _ => return Err(self.invalid(rest)),
            },
            State::Value => match b {
                b'\r' => self.state = State::ValueCr,
                b'\n' if self.lenient => self.state = State::FieldStart,
                _ if is_value_byte(b, self.lenient) => self.push_value(b),
                _ => return Err(self.invalid(rest)),
            },
            State::ValueCr => {
                if b == b'\n' {
                    self.state = State::FieldStart;
                } else {
                    return Err(self.invalid(rest));
                }
            }
            State::FoldStart => match b {
                b' ' | b'\t' => {}
                b'\r' => self.state = State::ValueCr,
                b'\n' if self.lenient => self.state = State::FieldStart,
                _ if is_value_byte(b, self.lenient) => {
                    // Continuation content joins the previous line with a
                    // single space; an empty continuation adds nothing.
                    self.value.truncate(self.end_of_text);
                    if self.end_of_text > 0 {
                        self.value.push(b' ');
                    }
                    self.push_value(b);
                    self.state = State::Value;
                }
                _ => return Err(self.invalid(rest)),
            },
            State::EndCr => {
                if b == b'\n' {
                    self.state = State::Done;
                } else {
                    return Err(self.invalid(rest));
                }
            }

            State::ArcUrl => match b {
                b' ' => {
                    self.finish_arc_url();
                    self.state = State::ArcIp;
                }
                b'\n' => return Err(self.invalid(rest)),
                _ => self.buf.push(b),
            },
            State::ArcIp => match b {
                b' ' => {
                    let ip = String::from_utf8_lossy(&self.buf).into_owned();
                    self.set_header("WARC-IP-Address", ip);
                    self.buf.clear();
                    self.state = State::ArcDate;
                }
                b'0'..=b'9' | b'.' | b':' | b'a'..=b'f' | b'A'..=b'F' => self.buf.push(b),
                _ => return Err(self.invalid(rest)),
            },
            State::ArcDate => match b {
                b' ' => {
                    self.finish_arc_date();
                    self.state = State::ArcMime;
                }
                b'0'..=b'9' => self.buf.push(b),
                _ => return Err(self.invalid(rest)),
            },
            State::ArcMime => match b {
                b' ' => {
                    // The ARC content-type column is unreliable in the wild
                    // and the synthesized Content-Type wins, so the value is
                    // tolerated and discarded.
                    self.buf.clear();
                    self.state = State::ArcLength { empty: true };
                }
                b'\n' => return Err(self.invalid(rest)),
                _ => self.buf.push(b),
            },
            State::ArcLength { empty } => match b {
                b'0'..=b'9' => {
                    self.buf.push(b);
                    self.state = State::ArcLength { empty: false };
                }
                b'\n' if !empty => {
                    let length = String::from_utf8_lossy(&self.buf).into_owned();
                    self.set_header("Content-Length", length);
                    self.buf.clear();
                    self.version = MessageVersion::ARC_1_1;
                    self.state = State::Done;
                }
                _ => return Err(self.invalid(rest)),
            },

            State::Done => {}
        }
        Ok(())
    }

    fn finish_version(&mut self) {
        self.version = MessageVersion::new(crate::headers::Protocol::Warc, self.major, self.minor);
    }

    fn set_header(&mut self, name: &str, value: String) {
        // Synthesized names are known-valid tokens.
        self.headers.set(HeaderName::new_unchecked(name.to_string()), value);
    }

    fn finish_arc_url(&mut self) {
        let url = String::from_utf8_lossy(&self.buf).into_owned();
        if let Some(filename) = url.strip_prefix("filedesc://") {
            self.set_header("WARC-Type", "warcinfo".to_string());
            self.set_header("WARC-Filename", filename.to_string());
            self.set_header("Content-Type", "text/plain".to_string());
        } else if url.starts_with("dns:") {
            self.set_header("WARC-Type", "response".to_string());
            self.set_header("Content-Type", "text/dns".to_string());
            self.set_header("WARC-Target-URI", url);
        } else {
            self.set_header("WARC-Type", "response".to_string());
            self.set_header("Content-Type", "application/http;msgtype=response".to_string());
            self.set_header("WARC-Target-URI", url);
        }
        self.buf.clear();
    }

    fn finish_arc_date(&mut self) {
        let mut date = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        // Truncated and overlong dates have been seen in the wild.
        if date.len() < 14 {
            warn!(digits = date.len(), "ARC date too short");
            date.push_str(&"00000000000000"[date.len()..]);
        } else if date.len() > 14 {
            warn!(digits = date.len(), "ARC date too long");
            date.truncate(14);
        }
        match NaiveDateTime::parse_from_str(&date, "%Y%m%d%H%M%S") {
            Ok(naive) => {
                let instant = Utc.from_utc_datetime(&naive);
                self.set_header("WARC-Date", instant.format("%Y-%m-%dT%H:%M:%SZ").to_string());
            }
            Err(_) => warn!(%date, "ARC date not parsable"),
        }
    }
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

fn is_name_byte(b: u8, lenient: bool) -> bool {
    if lenient {
        b != b':' && b != b'\r' && b != b'\n' && b != b' ' && b != b'\t'
    } else {
        b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={} \t".contains(&b)
    }
}

fn is_value_byte(b: u8, lenient: bool) -> bool {
    if lenient {
        b != b'\r' && b != b'\n'
    } else {
        b == b'\t' || (b != 0x7f && b >= 0x20)
    }
}

/// Parses an `application/warc-fields` body into a header map.
pub fn parse_warc_fields(data: &[u8]) -> Result<MessageHeaders, ParseError> {
    let mut parser = HeaderParser::warc_fields();
    parser.set_lenient(true);
    parser.update(data)?;
    parser.finish()?;
    Ok(parser.take_headers())
}
