//! HTTP/1.1 chunked transfer decoding.
//!
//! Each chunk is a hex size line (optionally followed by whitespace and a
//! `;extension`), CRLF, the data bytes, CRLF. A zero-size chunk introduces
//! the trailer: any trailer fields are read and discarded, and the final
//! CRLF ends the body. Hitting EOF before that terminator is an error, so
//! a truncated stream can never be mistaken for a complete one.
//!
//! Large chunks bypass the internal buffer: when the remaining chunk data
//! is at least one buffer's worth and the caller's destination is too, the
//! data is read straight into the destination.

use std::io::{self, Read};

use super::MessageBody;

const BUF_SIZE: usize = 8192;
const MAX_SIZE_DIGITS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    SizeWs,
    Extension,
    SizeCr,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    TrailerLineCr,
    TrailerEndCr,
    Done,
}

/// Decoder for a chunked transfer-encoded stream.
pub struct ChunkedBody<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    state: ChunkState,
    chunk_remaining: u64,
    size_digits: u32,
    position: u64,
}

impl<R: Read> ChunkedBody<R> {
    pub fn new(inner: R) -> Self {
        ChunkedBody {
            inner,
            buf: vec![0u8; BUF_SIZE],
            start: 0,
            end: 0,
            state: ChunkState::Size,
            chunk_remaining: 0,
            size_digits: 0,
            position: 0,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// Refills the internal buffer with at least one byte.
    fn refill(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.start, self.end);
        self.start = 0;
        self.end = 0;
        let n = self.inner.read(&mut self.buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of stream in chunked encoding",
            ));
        }
        self.end = n;
        Ok(())
    }

    fn bad(&self, message: &str) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, message.to_string())
    }

    /// Advances the framing machine by one byte. Only called outside the
    /// chunk data state.
    fn step(&mut self, b: u8) -> io::Result<()> {
        self.state = match self.state {
            ChunkState::Size => match b {
                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                    self.size_digits += 1;
                    if self.size_digits > MAX_SIZE_DIGITS {
                        return Err(self.bad("chunk length too long"));
                    }
                    let digit = (b as char).to_digit(16).unwrap_or(0) as u64;
                    self.chunk_remaining = (self.chunk_remaining << 4) | digit;
                    ChunkState::Size
                }
                b' ' | b'\t' if self.size_digits > 0 => ChunkState::SizeWs,
                b';' if self.size_digits > 0 => ChunkState::Extension,
                b'\r' if self.size_digits > 0 => ChunkState::SizeCr,
                _ => return Err(self.bad("invalid chunk length")),
            },
            ChunkState::SizeWs => match b {
                b' ' | b'\t' => ChunkState::SizeWs,
                b';' => ChunkState::Extension,
                b'\r' => ChunkState::SizeCr,
                _ => return Err(self.bad("invalid chunk header")),
            },
            ChunkState::Extension => match b {
                b'\r' => ChunkState::SizeCr,
                b'\n' => return Err(self.bad("invalid chunk extension")),
                _ => ChunkState::Extension,
            },
            ChunkState::SizeCr => match b {
                b'\n' if self.chunk_remaining == 0 => ChunkState::TrailerStart,
                b'\n' => ChunkState::Data,
                _ => return Err(self.bad("invalid chunk header")),
            },
            ChunkState::DataCr => match b {
                b'\r' => ChunkState::DataLf,
                _ => return Err(self.bad("missing CRLF after chunk data")),
            },
            ChunkState::DataLf => match b {
                b'\n' => {
                    self.size_digits = 0;
                    ChunkState::Size
                }
                _ => return Err(self.bad("missing CRLF after chunk data")),
            },
            ChunkState::TrailerStart => match b {
                b'\r' => ChunkState::TrailerEndCr,
                b'\n' => return Err(self.bad("invalid chunk trailer")),
                // A trailer field; read it and throw it away.
                _ => ChunkState::TrailerLine,
            },
            ChunkState::TrailerLine => match b {
                b'\r' => ChunkState::TrailerLineCr,
                _ => ChunkState::TrailerLine,
            },
            ChunkState::TrailerLineCr => match b {
                b'\n' => ChunkState::TrailerStart,
                _ => return Err(self.bad("invalid chunk trailer")),
            },
            ChunkState::TrailerEndCr => match b {
                b'\n' => ChunkState::Done,
                _ => return Err(self.bad("invalid chunk trailer")),
            },
            ChunkState::Data | ChunkState::Done => unreachable!("framing step in data state"),
        };
        Ok(())
    }
}

impl<R: Read> Read for ChunkedBody<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                ChunkState::Done => return Ok(0),
                ChunkState::Data => {
                    if self.chunk_remaining == 0 {
                        self.state = ChunkState::DataCr;
                        continue;
                    }
                    let limit = dst.len().min(self.chunk_remaining.min(usize::MAX as u64) as usize);
                    if self.buffered() > 0 {
                        let n = limit.min(self.buffered());
                        dst[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
                        self.start += n;
                        self.chunk_remaining -= n as u64;
                        self.position += n as u64;
                        return Ok(n);
                    }
                    if self.chunk_remaining >= self.buf.len() as u64 && dst.len() >= self.buf.len()
                    {
                        // Bypass: large chunk, large destination.
                        let n = self.inner.read(&mut dst[..limit])?;
                        if n == 0 {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "unexpected end of stream in chunked encoding",
                            ));
                        }
                        self.chunk_remaining -= n as u64;
                        self.position += n as u64;
                        return Ok(n);
                    }
                    self.refill()?;
                }
                _ => {
                    if self.buffered() == 0 {
                        self.refill()?;
                    }
                    while self.buffered() > 0 {
                        let b = self.buf[self.start];
                        self.start += 1;
                        self.step(b)?;
                        if self.state == ChunkState::Data || self.state == ChunkState::Done {
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl<R: Read> MessageBody for ChunkedBody<R> {
    fn size(&self) -> Option<u64> {
        None
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn is_consumed(&self) -> bool {
        self.state == ChunkState::Done
    }
}
