//! Zstandard decoding for `.warc.zst` archives.
//!
//! The warc-zstd convention compresses each record as its own zstd frame
//! and optionally prepends a skippable frame (magic `0x184D2A5D`) holding a
//! shared dictionary, itself possibly zstd-compressed. [`ZstdSource`]
//! detects and loads that dictionary, then decodes the remaining frames as
//! one continuous stream. Reading is the only direction supported; the
//! writer never produces zstd output.

use std::io::{self, BufReader, Chain, Cursor, Read};
use zstd::stream::read::Decoder;

pub const ZSTD_MAGIC: u32 = 0xFD2FB528;
pub const DICT_MAGIC: u32 = 0x184D2A5D;
const DICT_ID_FLAG_MASK: u8 = 3;

type Input<R> = BufReader<Chain<Cursor<Vec<u8>>, R>>;

/// Streaming decoder over the frames of a zstd-compressed archive.
pub struct ZstdSource<R: Read> {
    decoder: Decoder<'static, Input<R>>,
    output_position: u64,
}

impl<R: Read> ZstdSource<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let mut head = [0u8; 8];
        inner.read_exact(&mut head)?;
        let magic = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);

        let (dictionary, replay) = if magic == DICT_MAGIC {
            let frame_size = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
            let mut payload = vec![0u8; frame_size as usize];
            inner.read_exact(&mut payload)?;
            let dictionary = if payload.len() >= 4
                && u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]])
                    == ZSTD_MAGIC
            {
                // The embedded dictionary is itself zstd-compressed.
                zstd::stream::decode_all(Cursor::new(payload))?
            } else {
                payload
            };
            (Some(dictionary), Vec::new())
        } else if magic == ZSTD_MAGIC {
            if head[4] & DICT_ID_FLAG_MASK != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "zstd frame requires a dictionary but none precedes it",
                ));
            }
            (None, head.to_vec())
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected zstd magic number {:#x}", magic),
            ));
        };

        let input = BufReader::new(Cursor::new(replay).chain(inner));
        let decoder = match &dictionary {
            Some(dict) => Decoder::with_dictionary(input, dict)?,
            None => Decoder::with_buffer(input)?,
        };
        Ok(ZstdSource {
            decoder,
            output_position: 0,
        })
    }

    /// Decoded bytes produced so far.
    pub fn output_position(&self) -> u64 {
        self.output_position
    }
}

impl<R: Read> Read for ZstdSource<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let n = self.decoder.read(dst)?;
        self.output_position += n as u64;
        Ok(n)
    }
}

/// Decoder that stops at the end of the first frame instead of continuing
/// into the next one. Used when a single record's frame is decoded in
/// isolation.
pub fn single_frame_decoder<B: io::BufRead>(reader: B) -> io::Result<Decoder<'static, B>> {
    Ok(Decoder::with_buffer(reader)?.single_frame())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Write;

    #[test]
    fn decodes_plain_frames() {
        let first = zstd::stream::encode_all(Cursor::new(b"first record".to_vec()), 3).unwrap();
        let second = zstd::stream::encode_all(Cursor::new(b"second record".to_vec()), 3).unwrap();
        let mut archive = first;
        archive.extend_from_slice(&second);

        let mut source = ZstdSource::new(Cursor::new(archive)).unwrap();
        let mut out = Vec::new();
        source.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"first recordsecond record");
        assert_eq!(source.output_position(), out.len() as u64);
    }

    #[test]
    fn loads_dictionary_from_skippable_frame() {
        let dict: Vec<u8> = b"a content dictionary shared by the records ".repeat(8);
        let payload = b"a content dictionary shared by the records plus a tail";

        let mut encoder =
            zstd::stream::write::Encoder::with_dictionary(Vec::new(), 3, &dict).unwrap();
        encoder.write_all(payload).unwrap();
        let frame = encoder.finish().unwrap();

        let mut archive = Vec::new();
        archive.write_u32::<LittleEndian>(DICT_MAGIC).unwrap();
        archive.write_u32::<LittleEndian>(dict.len() as u32).unwrap();
        archive.extend_from_slice(&dict);
        archive.extend_from_slice(&frame);

        let mut source = ZstdSource::new(Cursor::new(archive)).unwrap();
        let mut out = Vec::new();
        source.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn rejects_unknown_magic() {
        let err = match ZstdSource::new(Cursor::new(vec![0u8; 16])) {
            Ok(_) => panic!("accepted a stream with a bogus magic number"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn single_frame_stops_at_boundary() {
        let first = zstd::stream::encode_all(Cursor::new(b"only this".to_vec()), 3).unwrap();
        let mut archive = first;
        archive.extend_from_slice(
            &zstd::stream::encode_all(Cursor::new(b"not this".to_vec()), 3).unwrap(),
        );

        let mut decoder = single_frame_decoder(BufReader::new(Cursor::new(archive))).unwrap();
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"only this");
    }
}
