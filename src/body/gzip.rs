//! Member-aware gzip codec.
//!
//! WARC recommends record-at-time compression: every record is its own gzip
//! member and the archive is the concatenation of members. The std-style
//! multi-stream decoders hide member boundaries, so this module drives raw
//! deflate directly and parses the gzip framing by hand:
//!
//! - [`GzipSource`] decodes a concatenation of members. A single `read`
//!   never returns bytes from two members, and [`GzipSource::input_position`]
//!   reports exactly how many compressed bytes have been consumed, which is
//!   what record offsets in a `.warc.gz` mean.
//! - [`GzipSink`] compresses writes into the current member and seals it on
//!   [`GzipSink::finish`], emitting the CRC32 and ISIZE trailer. The next
//!   write opens a fresh member.
//!
//! Both ends verify the trailer: a corrupt CRC, a wrong uncompressed size,
//! or truncation at any byte offset is an error, never silent.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io::{self, Read, Write};

pub const GZIP_MAGIC: u16 = 0x8b1f;
const CM_DEFLATE: u8 = 8;
const FHCRC: u8 = 2;
const FEXTRA: u8 = 4;
const FNAME: u8 = 8;
const FCOMMENT: u8 = 16;

const BUF_SIZE: usize = 8192;

// 1f 8b, deflate, no flags, zero mtime, zero xfl/os.
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, CM_DEFLATE, 0, 0, 0, 0, 0, 0, 0];

fn zip_error(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn eof(context: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("unexpected end of stream {}", context),
    )
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decoder for a stream of concatenated gzip members.
pub struct GzipSource<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    decompress: Decompress,
    crc: crc32fast::Hasher,
    member_out: u64,
    in_member: bool,
    input_position: u64,
    output_position: u64,
}

impl<R: Read> GzipSource<R> {
    pub fn new(inner: R) -> Self {
        GzipSource {
            inner,
            buf: vec![0u8; BUF_SIZE],
            start: 0,
            end: 0,
            decompress: Decompress::new(false),
            crc: crc32fast::Hasher::new(),
            member_out: 0,
            in_member: false,
            input_position: 0,
            output_position: 0,
        }
    }

    /// Compressed bytes consumed so far. At a member boundary this is the
    /// offset of the next member, which for record-at-time compression is
    /// the next record's position in the file.
    pub fn input_position(&self) -> u64 {
        self.input_position
    }

    /// Uncompressed bytes produced so far.
    pub fn output_position(&self) -> u64 {
        self.output_position
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Discards all buffered and in-flight state. Used after the underlying
    /// stream has been repositioned; `input_position` restarts from zero.
    pub fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
        self.decompress.reset(false);
        self.crc = crc32fast::Hasher::new();
        self.member_out = 0;
        self.in_member = false;
        self.input_position = 0;
        self.output_position = 0;
    }

    fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// Ensures at least `n` contiguous bytes are buffered. Returns false on
    /// clean EOF with nothing buffered at all.
    fn fill_at_least(&mut self, n: usize) -> io::Result<bool> {
        while self.buffered() < n {
            if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }
            let read = self.inner.read(&mut self.buf[self.end..])?;
            if read == 0 {
                return Ok(false);
            }
            self.end += read;
        }
        Ok(true)
    }

    fn take_byte(&mut self, context: &str) -> io::Result<u8> {
        if !self.fill_at_least(1)? {
            return Err(eof(context));
        }
        let b = self.buf[self.start];
        self.start += 1;
        self.input_position += 1;
        Ok(b)
    }

    /// Parses one member header. Returns false on clean EOF at a member
    /// boundary.
    fn read_header(&mut self) -> io::Result<bool> {
        if !self.fill_at_least(10)? {
            if self.buffered() > 0 {
                return Err(eof("in gzip header"));
            }
            return Ok(false);
        }
        let mut fixed = &self.buf[self.start..self.start + 10];
        let magic = fixed.read_u16::<LittleEndian>()?;
        if magic != GZIP_MAGIC {
            return Err(zip_error(format!("not in gzip format (magic={:#x})", magic)));
        }
        let cm = fixed.read_u8()?;
        if cm != CM_DEFLATE {
            return Err(zip_error(format!("unsupported compression method: {}", cm)));
        }
        let flg = fixed.read_u8()?;
        self.start += 10;
        self.input_position += 10;

        if flg & FEXTRA != 0 {
            let mut len_bytes = [0u8; 2];
            len_bytes[0] = self.take_byte("in gzip extra")?;
            len_bytes[1] = self.take_byte("in gzip extra")?;
            let xlen = u16::from_le_bytes(len_bytes);
            for _ in 0..xlen {
                self.take_byte("in gzip extra")?;
            }
        }
        if flg & FNAME != 0 {
            while self.take_byte("in gzip name")? != 0 {}
        }
        if flg & FCOMMENT != 0 {
            while self.take_byte("in gzip comment")? != 0 {}
        }
        if flg & FHCRC != 0 {
            self.take_byte("in gzip header crc")?;
            self.take_byte("in gzip header crc")?;
        }
        Ok(true)
    }

    fn read_trailer(&mut self) -> io::Result<()> {
        if !self.fill_at_least(8)? {
            return Err(eof("in gzip trailer"));
        }
        let mut trailer = &self.buf[self.start..self.start + 8];
        let expected_crc = trailer.read_u32::<LittleEndian>()?;
        let isize = trailer.read_u32::<LittleEndian>()?;
        self.start += 8;
        self.input_position += 8;

        if isize != (self.member_out & 0xffff_ffff) as u32 {
            return Err(zip_error("gzip uncompressed size mismatch".to_string()));
        }
        let actual_crc = self.crc.clone().finalize();
        if expected_crc != actual_crc {
            return Err(zip_error(format!(
                "bad gzip crc32: expected {:x} actual {:x}",
                expected_crc, actual_crc
            )));
        }
        Ok(())
    }

    /// Inflates into `dst` from buffered input, refilling as needed.
    /// Returns the bytes produced; on member end the trailer has been
    /// verified and the decoder is ready for the next member.
    fn read_member(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.buffered() == 0 && !self.fill_at_least(1)? {
                return Err(eof("in gzip deflate stream"));
            }
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(
                    &self.buf[self.start..self.end],
                    dst,
                    FlushDecompress::None,
                )
                .map_err(|e| zip_error(format!("deflate error: {}", e)))?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            self.start += consumed;
            self.input_position += consumed as u64;
            self.crc.update(&dst[..produced]);
            self.member_out += produced as u64;
            self.output_position += produced as u64;

            match status {
                Status::StreamEnd => {
                    self.read_trailer()?;
                    self.decompress.reset(false);
                    self.crc = crc32fast::Hasher::new();
                    self.member_out = 0;
                    self.in_member = false;
                    return Ok(produced);
                }
                _ if produced > 0 => return Ok(produced),
                _ => {}
            }
        }
    }
}

impl<R: Read> Read for GzipSource<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        loop {
            if !self.in_member {
                if !self.read_header()? {
                    return Ok(0);
                }
                self.in_member = true;
            }
            let n = self.read_member(dst)?;
            if n > 0 {
                return Ok(n);
            }
            // Member ended without producing output in this call; move on
            // to the next member rather than returning a zero-length read.
        }
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encoder writing a stream of gzip members, one per [`GzipSink::finish`].
pub struct GzipSink<W> {
    inner: W,
    compress: Compress,
    crc: crc32fast::Hasher,
    member_in: u64,
    header_written: bool,
    out_buf: Vec<u8>,
    output_position: u64,
}

impl<W: Write> GzipSink<W> {
    pub fn new(inner: W) -> Self {
        GzipSink {
            inner,
            compress: Compress::new(Compression::best(), false),
            crc: crc32fast::Hasher::new(),
            member_in: 0,
            header_written: false,
            out_buf: vec![0u8; BUF_SIZE],
            output_position: 0,
        }
    }

    /// Compressed bytes written so far, including headers and trailers of
    /// sealed members.
    pub fn output_position(&self) -> u64 {
        self.output_position
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn write_header(&mut self) -> io::Result<()> {
        self.inner.write_all(&GZIP_HEADER)?;
        self.output_position += GZIP_HEADER.len() as u64;
        self.header_written = true;
        Ok(())
    }

    /// Seals the current member: flushes the deflate stream and writes the
    /// CRC32 and ISIZE trailer. An empty member (no writes since the last
    /// finish) is valid and produces a well-formed zero-length member.
    pub fn finish(&mut self) -> io::Result<()> {
        if !self.header_written {
            self.write_header()?;
        }
        loop {
            let before_out = self.compress.total_out();
            let status = self
                .compress
                .compress(&[], &mut self.out_buf, FlushCompress::Finish)
                .map_err(|e| zip_error(format!("deflate error: {}", e)))?;
            let produced = (self.compress.total_out() - before_out) as usize;
            self.inner.write_all(&self.out_buf[..produced])?;
            self.output_position += produced as u64;
            if status == Status::StreamEnd {
                break;
            }
        }
        let mut trailer = [0u8; 8];
        {
            let mut cursor = &mut trailer[..];
            cursor.write_u32::<LittleEndian>(self.crc.clone().finalize())?;
            cursor.write_u32::<LittleEndian>((self.member_in & 0xffff_ffff) as u32)?;
        }
        self.inner.write_all(&trailer)?;
        self.output_position += 8;

        self.compress.reset();
        self.crc = crc32fast::Hasher::new();
        self.member_in = 0;
        self.header_written = false;
        Ok(())
    }
}

impl<W: Write> Write for GzipSink<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if !self.header_written {
            self.write_header()?;
        }
        let before_in = self.compress.total_in();
        let before_out = self.compress.total_out();
        let status = self
            .compress
            .compress(data, &mut self.out_buf, FlushCompress::None)
            .map_err(|e| zip_error(format!("deflate error: {}", e)))?;
        debug_assert_ne!(status, Status::StreamEnd);
        let consumed = (self.compress.total_in() - before_in) as usize;
        let produced = (self.compress.total_out() - before_out) as usize;
        self.inner.write_all(&self.out_buf[..produced])?;
        self.output_position += produced as u64;
        self.crc.update(&data[..consumed]);
        self.member_in += consumed as u64;
        if consumed == 0 {
            // Output buffer was full of pending compressed data; it has
            // been drained above, try again.
            return self.write(data);
        }
        Ok(consumed)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn gzip_member(data: &[u8]) -> Vec<u8> {
        let mut sink = GzipSink::new(Vec::new());
        sink.write_all(data).unwrap();
        sink.finish().unwrap();
        sink.into_inner()
    }

    #[test]
    fn round_trip_single_member() {
        let compressed = gzip_member(b"hello world");
        let mut source = GzipSource::new(Cursor::new(compressed.clone()));
        let mut out = Vec::new();
        source.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(source.input_position(), compressed.len() as u64);
        assert_eq!(source.output_position(), 11);
    }

    #[test]
    fn members_decode_independently() {
        let mut archive = gzip_member(b"first");
        archive.extend_from_slice(&gzip_member(b"second"));
        let mut source = GzipSource::new(Cursor::new(archive));

        // A single read never crosses a member boundary.
        let mut buf = [0u8; 64];
        let n = source.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let boundary = source.input_position();
        let n = source.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");
        assert_eq!(source.read(&mut buf).unwrap(), 0);
        assert_eq!(boundary, gzip_member(b"first").len() as u64);
    }

    #[test]
    fn empty_member_is_valid() {
        let mut sink = GzipSink::new(Vec::new());
        sink.finish().unwrap();
        let compressed = sink.into_inner();
        assert_eq!(&compressed[..3], &[0x1f, 0x8b, 0x08]);

        let mut source = GzipSource::new(Cursor::new(compressed));
        let mut out = Vec::new();
        source.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn truncation_at_every_offset_errors() {
        let compressed = gzip_member(b"The quick brown fox jumps over the lazy dog");
        for cut in 1..compressed.len() {
            let mut source = GzipSource::new(Cursor::new(compressed[..cut].to_vec()));
            let mut out = Vec::new();
            let result = source.read_to_end(&mut out);
            assert!(result.is_err(), "no error when truncated to {} bytes", cut);
        }
    }

    #[test]
    fn corrupt_crc_detected() {
        let mut compressed = gzip_member(b"payload bytes");
        let crc_offset = compressed.len() - 8;
        compressed[crc_offset] ^= 0xff;
        let mut source = GzipSource::new(Cursor::new(compressed));
        let mut out = Vec::new();
        let err = source.read_to_end(&mut out).unwrap_err();
        assert!(err.to_string().contains("crc32"), "{}", err);
    }

    #[test]
    fn corrupt_isize_detected() {
        let mut compressed = gzip_member(b"payload bytes");
        let isize_offset = compressed.len() - 1;
        compressed[isize_offset] ^= 0x01;
        let mut source = GzipSource::new(Cursor::new(compressed));
        let mut out = Vec::new();
        let err = source.read_to_end(&mut out).unwrap_err();
        assert!(err.to_string().contains("size mismatch"), "{}", err);
    }

    #[test]
    fn skips_optional_header_fields() {
        // Hand-built member with FNAME and FEXTRA set.
        let mut data = Vec::new();
        data.extend_from_slice(&[0x1f, 0x8b, 0x08, FEXTRA | FNAME, 0, 0, 0, 0, 0, 0]);
        data.extend_from_slice(&[3, 0]); // XLEN
        data.extend_from_slice(b"abc"); // extra field
        data.extend_from_slice(b"file.warc\0");
        let body = gzip_member(b"x");
        data.extend_from_slice(&body[10..]); // deflate stream + trailer

        let mut source = GzipSource::new(Cursor::new(data));
        let mut out = Vec::new();
        source.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"x");
    }

    #[test]
    fn sink_output_position_tracks_bytes() {
        let mut sink = GzipSink::new(Vec::new());
        sink.write_all(b"some bytes to compress").unwrap();
        sink.finish().unwrap();
        let len = sink.output_position();
        assert_eq!(len, sink.into_inner().len() as u64);
    }
}
