pub mod body;
pub mod capture;
pub mod digest;
pub mod error;
pub mod headers;
pub mod http;
pub mod parser;
pub mod reader;
pub mod record;
pub mod validator;
pub mod writer;

pub use capture::{CaptureReader, SegmentAssembler, WarcCapture};
pub use digest::WarcDigest;
pub use error::{Result, WarcError};
pub use headers::{HeaderName, MessageHeaders, MessageVersion, Protocol};
pub use reader::{Compression, WarcReader};
pub use record::{OwnedBody, TruncationReason, WarcBuilder, WarcRecord, WarcType};
pub use validator::HeaderValidator;
pub use writer::{FetchOptions, FetchResult, WarcWriter};
