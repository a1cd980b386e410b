//! Body framing for record and HTTP message payloads.
//!
//! Four framings cover everything the container formats need:
//!
//! - [`LengthedBody`] — exactly `Content-Length` bytes of an underlying
//!   stream, never reading past them.
//! - [`chunked::ChunkedBody`] — HTTP/1.1 chunked transfer decoding.
//! - [`gzip::GzipSource`] / [`gzip::GzipSink`] — member-aware gzip, one
//!   compressed member per record.
//! - [`zstd::ZstdSource`] — zstd frames, with the optional embedded
//!   dictionary frame some archives carry.

pub mod chunked;
pub mod gzip;
pub mod zstd;

use std::io::{self, Read};

/// A readable message payload with optional known size and a consumption
/// cursor.
pub trait MessageBody: Read {
    /// Declared size in bytes, when the framing knows it up front.
    fn size(&self) -> Option<u64>;

    /// Bytes produced so far.
    fn position(&self) -> u64;

    fn is_consumed(&self) -> bool {
        match self.size() {
            Some(size) => self.position() >= size,
            None => false,
        }
    }
}

/// A body of exactly `size` bytes read from an underlying stream.
///
/// Reads are clamped so the underlying reader is never advanced past the
/// declared end. An early EOF is an error carrying the shortfall.
pub struct LengthedBody<R> {
    inner: R,
    size: u64,
    position: u64,
}

impl<R: Read> LengthedBody<R> {
    pub fn new(inner: R, size: u64) -> Self {
        LengthedBody {
            inner,
            size,
            position: 0,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Reads and discards the rest of the body.
    pub fn consume(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 8192];
        while self.position < self.size {
            if self.read(&mut chunk)? == 0 {
                break;
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for LengthedBody<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size - self.position;
        if remaining == 0 || dst.is_empty() {
            return Ok(0);
        }
        let limit = dst.len().min(remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut dst[..limit])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {} more bytes in body", remaining),
            ));
        }
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read> MessageBody for LengthedBody<R> {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn position(&self) -> u64 {
        self.position
    }
}
