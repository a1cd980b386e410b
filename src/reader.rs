//! Sequential record reading.
//!
//! `WarcReader` pulls records out of a WARC or ARC stream, transparently
//! decoding gzip and zstd. Records are handed out one at a time; the body
//! of each borrows the reader, so the previous record must be dropped
//! before the next one is requested. Any unread body is drained
//! automatically.
//!
//! # Positions
//!
//! `position()` reports the file offset of the most recently returned
//! record. For compressed input this is the offset in the *compressed*
//! stream and is only meaningful when each record was compressed as its
//! own member, which is how WARC files are conventionally written.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use digest::DynDigest;
use tracing::warn;

use crate::body::gzip::GzipSource;
use crate::body::zstd::{ZstdSource, DICT_MAGIC, ZSTD_MAGIC};
use crate::body::MessageBody;
use crate::digest::{digester, WarcDigest};
use crate::error::{Result, WarcError};
use crate::headers::Protocol;
use crate::parser::{HeaderParser, ParseError};
use crate::record::WarcRecord;

const BUF_SIZE: usize = 8192;

pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// The raw byte source, seekable or not.
enum Input {
    Stream(Box<dyn Read>),
    Seekable(Box<dyn ReadSeek>),
}

impl Read for Input {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match self {
            Input::Stream(r) => r.read(dst),
            Input::Seekable(r) => r.read(dst),
        }
    }
}

/// Compression detected on the outer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

enum Decoded {
    Plain(Input),
    Gzip(GzipSource<Input>),
    Zstd(ZstdSource<Input>),
}

impl Read for Decoded {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match self {
            Decoded::Plain(r) => r.read(dst),
            Decoded::Gzip(r) => r.read(dst),
            Decoded::Zstd(r) => r.read(dst),
        }
    }
}

fn detect(head: &[u8]) -> Compression {
    if head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b {
        return Compression::Gzip;
    }
    if head.len() >= 4 {
        let magic = LittleEndian::read_u32(head);
        if magic == ZSTD_MAGIC || magic == DICT_MAGIC {
            return Compression::Zstd;
        }
    }
    Compression::None
}

fn read_head(reader: &mut impl Read, head: &mut [u8; 4]) -> io::Result<usize> {
    let mut n = 0;
    while n < head.len() {
        let m = reader.read(&mut head[n..])?;
        if m == 0 {
            break;
        }
        n += m;
    }
    Ok(n)
}

// ── Reader ────────────────────────────────────────────────────────────────────

pub struct WarcReader {
    source: Decoded,
    buf: Vec<u8>,
    buf_start: usize,
    buf_end: usize,
    parser: HeaderParser,
    lenient: bool,
    calculate_digest: bool,
    digester: Option<(String, Box<dyn DynDigest>)>,
    last_block_digest: Option<WarcDigest>,
    base_offset: u64,
    consumed: u64,
    start_position: u64,
    header_length: u64,
    body_remaining: u64,
    trailer_pending: bool,
    arc_trailer: bool,
}

impl WarcReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_seekable(File::open(path)?)
    }

    /// Reads from a non-seekable stream. `seek` is unavailable.
    pub fn new<R: Read + 'static>(stream: R) -> Result<Self> {
        let mut stream: Box<dyn Read> = Box::new(stream);
        let mut head = [0u8; 4];
        let n = read_head(&mut stream, &mut head)?;
        let compression = detect(&head[..n]);
        let replay = Cursor::new(head[..n].to_vec());
        let input = Input::Stream(Box::new(replay.chain(stream)));
        Self::from_input(input, compression, 0)
    }

    pub fn from_seekable<R: Read + Seek + 'static>(mut reader: R) -> Result<Self> {
        let start = reader.stream_position()?;
        let mut head = [0u8; 4];
        let n = read_head(&mut reader, &mut head)?;
        reader.seek(SeekFrom::Start(start))?;
        Self::from_input(Input::Seekable(Box::new(reader)), detect(&head[..n]), start)
    }

    fn from_input(input: Input, compression: Compression, base_offset: u64) -> Result<Self> {
        let source = match compression {
            Compression::None => Decoded::Plain(input),
            Compression::Gzip => Decoded::Gzip(GzipSource::new(input)),
            Compression::Zstd => Decoded::Zstd(ZstdSource::new(input)?),
        };
        Ok(WarcReader {
            source,
            buf: vec![0u8; BUF_SIZE],
            buf_start: 0,
            buf_end: 0,
            parser: HeaderParser::new(),
            lenient: false,
            calculate_digest: false,
            digester: None,
            last_block_digest: None,
            base_offset,
            consumed: 0,
            start_position: base_offset,
            header_length: 0,
            body_remaining: 0,
            trailer_pending: false,
            arc_trailer: false,
        })
    }

    pub fn compression(&self) -> Compression {
        match self.source {
            Decoded::Plain(_) => Compression::None,
            Decoded::Gzip(_) => Compression::Gzip,
            Decoded::Zstd(_) => Compression::Zstd,
        }
    }

    /// Tolerate bare LF line endings and illegal header characters.
    pub fn set_lenient(&mut self, lenient: bool) {
        self.lenient = lenient;
        self.parser.set_lenient(lenient);
    }

    /// When enabled, the block of each record carrying a
    /// `WARC-Block-Digest` header is hashed as it is read. The result is
    /// available from [`calculated_block_digest`](Self::calculated_block_digest)
    /// once the record is finished. Records without the header, or with an
    /// unknown algorithm, are skipped.
    pub fn calculate_block_digest(&mut self, enabled: bool) {
        self.calculate_digest = enabled;
    }

    /// Offset of the most recently returned record.
    pub fn position(&self) -> u64 {
        self.start_position
    }

    /// Serialized header length of the most recently returned record.
    pub fn header_length(&self) -> u64 {
        self.header_length
    }

    /// Digest calculated over the last record's block. Any unread body is
    /// drained first. Returns `None` when digest calculation was off or
    /// the record declared none.
    pub fn calculated_block_digest(&mut self) -> Result<Option<WarcDigest>> {
        self.drain_body()?;
        self.finish_digest();
        Ok(self.last_block_digest.clone())
    }

    /// Repositions the reader to a record boundary at `offset` in the
    /// underlying file. Only possible for seekable plain or gzip input;
    /// zstd frames cannot be entered mid-stream.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        let input = match &mut self.source {
            Decoded::Plain(input) => input,
            Decoded::Gzip(gz) => gz.get_mut(),
            Decoded::Zstd(_) => return Err(WarcError::Unsupported("seek in zstd stream")),
        };
        match input {
            Input::Seekable(r) => {
                r.seek(SeekFrom::Start(offset))?;
            }
            Input::Stream(_) => {
                return Err(WarcError::Unsupported("seek in non-seekable stream"))
            }
        }
        if let Decoded::Gzip(gz) = &mut self.source {
            gz.reset();
        }
        self.buf_start = 0;
        self.buf_end = 0;
        self.parser.reset();
        self.digester = None;
        self.last_block_digest = None;
        self.base_offset = offset;
        self.consumed = 0;
        self.start_position = offset;
        self.header_length = 0;
        self.body_remaining = 0;
        self.trailer_pending = false;
        Ok(())
    }

    /// Reads the next record, or `None` at a clean end of stream. Any
    /// unread part of the previous record's body is drained first.
    pub fn next(&mut self) -> Result<Option<WarcRecord<RecordBody<'_>>>> {
        if self.trailer_pending {
            self.drain_body()?;
            self.finish_digest();
            self.consume_trailer()?;
        }
        self.start_position = self.current_offset();

        self.parser.reset();
        loop {
            if self.buffered() == 0 && !self.fill()? {
                if self.parser.position() == 0 {
                    return Ok(None);
                }
                return Err(ParseError::Truncated {
                    position: self.start_position + self.parser.position(),
                }
                .into());
            }
            let consumed = self
                .parser
                .update(&self.buf[self.buf_start..self.buf_end])?;
            self.advance(consumed);
            if self.parser.is_finished() {
                break;
            }
        }

        self.header_length = self.parser.position();
        let version = self.parser.version();
        let headers = self.parser.take_headers();
        let content_length = headers
            .first("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        self.body_remaining = content_length;
        self.trailer_pending = true;
        self.arc_trailer = version.protocol == Protocol::Arc;

        self.digester = None;
        self.last_block_digest = None;
        if self.calculate_digest {
            if let Some(declared) = headers.first("WARC-Block-Digest") {
                match declared.parse::<WarcDigest>() {
                    Ok(digest) => match digester(digest.algorithm()) {
                        Ok(hasher) => {
                            self.digester = Some((digest.algorithm().to_string(), hasher))
                        }
                        Err(_) => warn!(algorithm = digest.algorithm(), "unknown digest algorithm"),
                    },
                    Err(_) => warn!(value = declared, "unparsable block digest"),
                }
            }
        }

        let body = RecordBody {
            size: content_length,
            reader: self,
        };
        Ok(Some(WarcRecord::new(version, headers, body)))
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn buffered(&self) -> usize {
        self.buf_end - self.buf_start
    }

    fn advance(&mut self, n: usize) {
        self.buf_start += n;
        self.consumed += n as u64;
    }

    /// Refills the empty lookahead buffer. False on end of stream.
    fn fill(&mut self) -> io::Result<bool> {
        debug_assert_eq!(self.buf_start, self.buf_end);
        self.buf_start = 0;
        self.buf_end = self.source.read(&mut self.buf)?;
        Ok(self.buf_end > 0)
    }

    /// Ensures `n` contiguous buffered bytes. False on end of stream.
    fn fill_at_least(&mut self, n: usize) -> io::Result<bool> {
        while self.buffered() < n {
            if self.buf_start > 0 {
                self.buf.copy_within(self.buf_start..self.buf_end, 0);
                self.buf_end -= self.buf_start;
                self.buf_start = 0;
            }
            let m = self.source.read(&mut self.buf[self.buf_end..])?;
            if m == 0 {
                return Ok(false);
            }
            self.buf_end += m;
        }
        Ok(true)
    }

    fn current_offset(&self) -> u64 {
        match &self.source {
            Decoded::Plain(_) => self.base_offset + self.consumed,
            // Exact only at a member boundary with an empty lookahead
            // buffer, i.e. when records are compressed one per member.
            Decoded::Gzip(gz) => self.base_offset + gz.input_position(),
            // No compressed-offset tracking; this is the decoded offset.
            Decoded::Zstd(_) => self.base_offset + self.consumed,
        }
    }

    fn read_body(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if self.body_remaining == 0 || dst.is_empty() {
            return Ok(0);
        }
        let want = dst.len().min(self.body_remaining.min(usize::MAX as u64) as usize);
        let n = if self.buffered() > 0 {
            let take = want.min(self.buffered());
            dst[..take].copy_from_slice(&self.buf[self.buf_start..self.buf_start + take]);
            self.advance(take);
            take
        } else {
            let n = self.source.read(&mut dst[..want])?;
            self.consumed += n as u64;
            n
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {} more bytes in record body", self.body_remaining),
            ));
        }
        self.body_remaining -= n as u64;
        if let Some((_, hasher)) = &mut self.digester {
            hasher.update(&dst[..n]);
        }
        Ok(n)
    }

    fn drain_body(&mut self) -> io::Result<()> {
        let mut sink = [0u8; BUF_SIZE];
        while self.body_remaining > 0 {
            self.read_body(&mut sink)?;
        }
        Ok(())
    }

    fn finish_digest(&mut self) {
        if let Some((algorithm, hasher)) = self.digester.take() {
            self.last_block_digest = Some(WarcDigest::from_digester(&algorithm, hasher));
        }
    }

    /// Consumes the record separator: CRLFCRLF for WARC, one LF for ARC.
    /// On a malformed trailer a warning is logged and an arbitrary run of
    /// CR and LF bytes is skipped so reading can continue.
    fn consume_trailer(&mut self) -> io::Result<()> {
        self.trailer_pending = false;
        let expected: &[u8] = if self.arc_trailer { b"\n" } else { b"\r\n\r\n" };
        if !self.fill_at_least(expected.len())? {
            warn!("invalid record trailer");
            return Ok(());
        }
        if &self.buf[self.buf_start..self.buf_start + expected.len()] == expected {
            self.advance(expected.len());
            return Ok(());
        }
        warn!("invalid record trailer");
        if self.arc_trailer {
            // Leave the byte for the next record.
            return Ok(());
        }
        loop {
            if self.buffered() == 0 && !self.fill()? {
                return Ok(());
            }
            let b = self.buf[self.buf_start];
            if b != b'\r' && b != b'\n' {
                return Ok(());
            }
            self.advance(1);
        }
    }
}

// ── Body handle ───────────────────────────────────────────────────────────────

/// The block of the current record, streamed straight off the input.
pub struct RecordBody<'a> {
    reader: &'a mut WarcReader,
    size: u64,
}

impl Read for RecordBody<'_> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.reader.read_body(dst)
    }
}

impl MessageBody for RecordBody<'_> {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn position(&self) -> u64 {
        self.size - self.reader.body_remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::gzip::GzipSink;
    use crate::record::WarcType;
    use std::io::Write;

    fn raw_record(body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write!(
            out,
            "WARC/1.1\r\n\
             WARC-Type: resource\r\n\
             WARC-Record-ID: <urn:uuid:b94f4ec8-8a73-4b6b-a3ec-8b6ae0f3605c>\r\n\
             WARC-Date: 2024-01-19T01:42:52Z\r\n\
             Content-Length: {}\r\n\
             \r\n",
            body.len()
        )
        .unwrap();
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n\r\n");
        out
    }

    fn read_body(record: &mut WarcRecord<RecordBody<'_>>) -> String {
        let mut out = String::new();
        record.body_mut().read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn reads_consecutive_records() {
        let mut data = raw_record(b"first body");
        let first_len = data.len() as u64;
        data.extend_from_slice(&raw_record(b"second"));

        let mut reader = WarcReader::new(Cursor::new(data)).unwrap();
        assert_eq!(reader.compression(), Compression::None);

        let mut record = reader.next().unwrap().unwrap();
        assert_eq!(record.warc_type(), WarcType::Resource);
        assert_eq!(record.body().size(), Some(10));
        assert_eq!(read_body(&mut record), "first body");
        drop(record);
        assert_eq!(reader.position(), 0);

        let mut record = reader.next().unwrap().unwrap();
        assert_eq!(read_body(&mut record), "second");
        drop(record);
        assert_eq!(reader.position(), first_len);

        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn drains_unread_body() {
        let mut data = raw_record(b"a body that is never read");
        data.extend_from_slice(&raw_record(b"next"));
        let mut reader = WarcReader::new(Cursor::new(data)).unwrap();
        drop(reader.next().unwrap().unwrap());
        let mut record = reader.next().unwrap().unwrap();
        assert_eq!(read_body(&mut record), "next");
    }

    #[test]
    fn gzip_member_per_record() {
        let mut compressed = Vec::new();
        let mut first_len = 0;
        for (i, body) in [&b"first body"[..], b"second"].iter().enumerate() {
            let mut sink = GzipSink::new(Vec::new());
            sink.write_all(&raw_record(body)).unwrap();
            sink.finish().unwrap();
            let member = sink.into_inner();
            if i == 0 {
                first_len = member.len() as u64;
            }
            compressed.extend_from_slice(&member);
        }

        let mut reader = WarcReader::new(Cursor::new(compressed)).unwrap();
        assert_eq!(reader.compression(), Compression::Gzip);
        let mut record = reader.next().unwrap().unwrap();
        assert_eq!(read_body(&mut record), "first body");
        drop(record);

        let mut record = reader.next().unwrap().unwrap();
        assert_eq!(read_body(&mut record), "second");
        drop(record);
        assert_eq!(reader.position(), first_len);
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn seek_to_second_record() {
        let mut data = raw_record(b"first body");
        let first_len = data.len() as u64;
        data.extend_from_slice(&raw_record(b"second"));

        let mut reader = WarcReader::from_seekable(Cursor::new(data)).unwrap();
        reader.seek(first_len).unwrap();
        let mut record = reader.next().unwrap().unwrap();
        assert_eq!(read_body(&mut record), "second");
        drop(record);
        assert_eq!(reader.position(), first_len);

        // Back to the start.
        reader.seek(0).unwrap();
        let mut record = reader.next().unwrap().unwrap();
        assert_eq!(read_body(&mut record), "first body");
    }

    #[test]
    fn seek_rejected_on_stream_input() {
        let data = raw_record(b"body");
        let mut reader = WarcReader::new(Cursor::new(data)).unwrap();
        assert!(matches!(reader.seek(0), Err(WarcError::Unsupported(_))));
    }

    #[test]
    fn reads_arc_file() {
        let data = b"filedesc://test.arc 0.0.0.0 20040119014252 text/plain 10\n\
                     1 0 test\r\n\n\
                     http://example.org/ 127.0.0.1 20040119014253 text/html 5\n\
                     hello\n";
        let mut reader = WarcReader::new(Cursor::new(data.to_vec())).unwrap();

        let record = reader.next().unwrap().unwrap();
        assert_eq!(record.warc_type(), WarcType::Warcinfo);
        assert_eq!(record.headers().first("WARC-Filename"), Some("test.arc"));
        drop(record);

        let mut record = reader.next().unwrap().unwrap();
        assert_eq!(record.warc_type(), WarcType::Response);
        assert_eq!(record.target_uri(), Some("http://example.org/"));
        assert_eq!(
            record.content_type(),
            Some("application/http;msgtype=response")
        );
        assert_eq!(record.date().unwrap().to_rfc3339(), "2004-01-19T01:42:53+00:00");
        assert_eq!(read_body(&mut record), "hello");
        drop(record);
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn recovers_from_bad_trailer() {
        let mut data = raw_record(b"first body");
        // A writer that emitted only a single CRLF after the block.
        data.truncate(data.len() - 2);
        data.extend_from_slice(&raw_record(b"second"));
        let mut reader = WarcReader::new(Cursor::new(data)).unwrap();
        drop(reader.next().unwrap().unwrap());
        let mut record = reader.next().unwrap().unwrap();
        assert_eq!(read_body(&mut record), "second");
    }

    #[test]
    fn truncated_header_is_an_error() {
        let data = b"WARC/1.1\r\nWARC-Type: resource\r\n".to_vec();
        let mut reader = WarcReader::new(Cursor::new(data)).unwrap();
        assert!(matches!(
            reader.next(),
            Err(WarcError::Parse(ParseError::Truncated { .. }))
        ));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut data = raw_record(b"full body here");
        data.truncate(data.len() - 12);
        let mut reader = WarcReader::new(Cursor::new(data)).unwrap();
        let mut record = reader.next().unwrap().unwrap();
        let mut out = Vec::new();
        let err = record.body_mut().read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn digest_calculated_while_reading() {
        let body = b"hello world";
        let declared = WarcDigest::compute("sha1", body).unwrap();
        let mut data = Vec::new();
        write!(
            data,
            "WARC/1.1\r\n\
             WARC-Type: resource\r\n\
             WARC-Record-ID: <urn:uuid:b94f4ec8-8a73-4b6b-a3ec-8b6ae0f3605c>\r\n\
             WARC-Date: 2024-01-19T01:42:52Z\r\n\
             WARC-Block-Digest: {}\r\n\
             Content-Length: {}\r\n\
             \r\n",
            declared,
            body.len()
        )
        .unwrap();
        data.extend_from_slice(body);
        data.extend_from_slice(b"\r\n\r\n");

        let mut reader = WarcReader::new(Cursor::new(data)).unwrap();
        reader.calculate_block_digest(true);
        let record = reader.next().unwrap().unwrap();
        let from_header = record.block_digest().unwrap();
        drop(record);
        let calculated = reader.calculated_block_digest().unwrap().unwrap();
        assert_eq!(calculated, from_header);
    }

    #[test]
    fn lenient_mode_accepts_bare_lf() {
        let data = b"WARC/1.1\n\
            WARC-Type: resource\n\
            WARC-Record-ID: <urn:uuid:b94f4ec8-8a73-4b6b-a3ec-8b6ae0f3605c>\n\
            WARC-Date: 2024-01-19T01:42:52Z\n\
            Content-Length: 5\n\
            \n\
            hello\r\n\r\n";
        let mut reader = WarcReader::new(Cursor::new(data.to_vec())).unwrap();
        reader.set_lenient(true);
        let mut record = reader.next().unwrap().unwrap();
        assert_eq!(read_body(&mut record), "hello");
    }
}
