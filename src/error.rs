use std::io;

use thiserror::Error;

use crate::capture::SegmentError;
use crate::digest::DigestError;
use crate::headers::HeaderError;
use crate::http::HttpError;
use crate::parser::ParseError;
use crate::record::BuildError;

/// Any error the library can produce. The per-module error types convert
/// into this one, so `?` works across module boundaries.
#[derive(Error, Debug)]
pub enum WarcError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Digest(#[from] DigestError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, WarcError>;
