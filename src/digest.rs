//! WARC digest values and the hash algorithms behind them.
//!
//! A `WARC-Block-Digest` or `WARC-Payload-Digest` field holds
//! `algorithm:value` where the value may be hex (base16), base32 or base64
//! depending on which tool wrote the file. The canonical form, and the one
//! [`WarcDigest`] stores, is RFC 4648 base32. Values in other encodings are
//! detected by their length relative to the algorithm's digest size and
//! re-encoded; values for unknown algorithms are kept verbatim since there
//! is no way to verify them anyway.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use digest::DynDigest;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DigestError {
    #[error("Invalid WARC digest: {0:?}")]
    Invalid(String),
    #[error("Unknown digest algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("Invalid base32 character: {0:?}")]
    InvalidBase32(char),
    #[error("Invalid digest encoding: {0}")]
    InvalidEncoding(String),
}

/// Returns a hasher for a WARC digest algorithm name like `sha1` or
/// `sha-256`.
pub fn digester(algorithm: &str) -> Result<Box<dyn DynDigest>, DigestError> {
    let normalized: String = algorithm
        .to_ascii_lowercase()
        .chars()
        .filter(|c| *c != '-')
        .collect();
    match normalized.as_str() {
        "sha1" => Ok(Box::new(sha1::Sha1::default())),
        "sha256" => Ok(Box::new(sha2::Sha256::default())),
        "sha512" => Ok(Box::new(sha2::Sha512::default())),
        "md5" => Ok(Box::new(md5::Md5::default())),
        _ => Err(DigestError::UnknownAlgorithm(algorithm.to_string())),
    }
}

/// A digest header value: an algorithm name and a base32 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WarcDigest {
    algorithm: String,
    value: String,
}

impl WarcDigest {
    /// Builds a digest from a value in whichever of hex, base32 or base64
    /// its length implies for the given algorithm.
    pub fn new(algorithm: impl Into<String>, value: impl Into<String>) -> Result<Self, DigestError> {
        let algorithm = algorithm.into();
        let value = normalize(&algorithm, value.into())?;
        Ok(WarcDigest { algorithm, value })
    }

    pub fn from_bytes(algorithm: impl Into<String>, bytes: &[u8]) -> Self {
        WarcDigest {
            algorithm: algorithm.into(),
            value: base32_encode(bytes),
        }
    }

    /// Hashes `data` with the named algorithm.
    pub fn compute(algorithm: &str, data: &[u8]) -> Result<Self, DigestError> {
        let mut hasher = digester(algorithm)?;
        hasher.update(data);
        let bytes = hasher.finalize_reset();
        Ok(Self::from_bytes(algorithm, &bytes))
    }

    /// Wraps the output of a finished hasher.
    pub fn from_digester(algorithm: &str, hasher: Box<dyn DynDigest>) -> Self {
        Self::from_bytes(algorithm, &hasher.finalize())
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The digest in its canonical base32 form.
    pub fn base32(&self) -> &str {
        &self.value
    }

    pub fn bytes(&self) -> Result<Vec<u8>, DigestError> {
        base32_decode(&self.value)
    }

    pub fn hex(&self) -> Result<String, DigestError> {
        Ok(hex::encode(self.bytes()?))
    }

    pub fn base64(&self) -> Result<String, DigestError> {
        Ok(base64::engine::general_purpose::STANDARD.encode(self.bytes()?))
    }

    /// A hasher for this digest's algorithm, for recomputing it over data.
    pub fn digester(&self) -> Result<Box<dyn DynDigest>, DigestError> {
        digester(&self.algorithm)
    }
}

impl FromStr for WarcDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((algorithm, value)) => WarcDigest::new(algorithm, value),
            None => Err(DigestError::Invalid(s.to_string())),
        }
    }
}

impl fmt::Display for WarcDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

/// Re-encodes `value` to base32 when its length marks it as hex or base64
/// for the algorithm's digest size. Anything else, including values for
/// unknown algorithms, passes through untouched.
fn normalize(algorithm: &str, value: String) -> Result<String, DigestError> {
    let length = match digester(algorithm) {
        Ok(hasher) => hasher.output_size(),
        Err(_) => return Ok(value),
    };
    if length * 2 == value.len() {
        let bytes =
            hex::decode(&value).map_err(|e| DigestError::InvalidEncoding(e.to_string()))?;
        Ok(base32_encode(&bytes))
    } else if length * 8 / 5 <= value.len() {
        Ok(value)
    } else if length * 8 / 6 <= value.len() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&value)
            .map_err(|e| DigestError::InvalidEncoding(e.to_string()))?;
        Ok(base32_encode(&bytes))
    } else {
        Ok(value)
    }
}

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

pub fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() + 4) / 5 * 8);
    for group in data.chunks(5) {
        let mut bits = 0u64;
        for i in 0..5 {
            bits = (bits << 8) | u64::from(*group.get(i).unwrap_or(&0));
        }
        let chars = match group.len() {
            5 => 8,
            4 => 7,
            3 => 5,
            2 => 4,
            _ => 2,
        };
        for j in 0..chars {
            let index = ((bits >> (5 * (7 - j))) & 31) as usize;
            out.push(BASE32_ALPHABET[index] as char);
        }
        for _ in chars..8 {
            out.push('=');
        }
    }
    out
}

pub fn base32_decode(data: &str) -> Result<Vec<u8>, DigestError> {
    let mut out = Vec::with_capacity(data.len() / 8 * 5 + 5);
    let mut padding = 0usize;
    let bytes = data.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let mut bits = 0u64;
        for j in 0..8 {
            let c = if i + j < bytes.len() {
                bytes[i + j]
            } else {
                b'='
            };
            let value = match c.to_ascii_uppercase() {
                b'A'..=b'Z' => u64::from(c.to_ascii_uppercase() - b'A'),
                b'2'..=b'7' => u64::from(c - b'2' + 26),
                b'=' => {
                    padding += 1;
                    0
                }
                _ => return Err(DigestError::InvalidBase32(c as char)),
            };
            bits = (bits << 5) | value;
        }
        for j in 0..5 {
            out.push(((bits >> (8 * (4 - j))) & 0xff) as u8);
        }
        i += 8;
    }
    if padding > 0 {
        let trim = 5 - (43 - 5 * padding) / 8;
        out.truncate(out.len() - trim);
    }
    Ok(out)
}
