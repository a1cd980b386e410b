//! Capture events and record segmentation.
//!
//! A capture event is a run of records describing one fetch of one
//! resource: typically a response or resource record plus the request and
//! metadata records linked to it by `WARC-Concurrent-To`.
//! [`CaptureReader`] groups a file's records into such events. A capture
//! closes as soon as a record unrelated to it, or the end of the file, is
//! reached.
//!
//! [`SegmentAssembler`] undoes record segmentation, stitching a first
//! segment and its continuation records back into one logical record.

use std::collections::{HashMap, HashSet};
use std::io::Read;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::error::Result;
use crate::reader::WarcReader;
use crate::record::{OwnedBody, WarcRecord, WarcType};

// ── Concurrency testing ───────────────────────────────────────────────────────

/// Tracks the record ids of one capture event so later records can be
/// tested for membership through their `WARC-Concurrent-To` links.
#[derive(Default)]
pub struct ConcurrentRecordSet {
    set: HashSet<Url>,
}

impl ConcurrentRecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record's id and everything it declares itself concurrent to.
    pub fn add<B>(&mut self, record: &WarcRecord<B>) {
        if let Some(id) = record.id() {
            self.set.insert(id);
        }
        self.set.extend(record.concurrent_to());
    }

    /// Whether the record is linked to any previously added record, in
    /// either direction.
    pub fn contains<B>(&self, record: &WarcRecord<B>) -> bool {
        if record.id().is_some_and(|id| self.set.contains(&id)) {
            return true;
        }
        record.concurrent_to().iter().any(|id| self.set.contains(id))
    }

    pub fn clear(&mut self) {
        self.set.clear();
    }
}

// ── Capture events ────────────────────────────────────────────────────────────

/// One capture event: all records of one fetch, read into memory.
pub struct WarcCapture {
    records: Vec<WarcRecord<OwnedBody>>,
    warcinfo_id: Option<Url>,
}

impl WarcCapture {
    /// The main record: the first response, resource or revisit record,
    /// or failing that the first record of the event.
    pub fn main(&self) -> &WarcRecord<OwnedBody> {
        self.records
            .iter()
            .find(|r| r.warc_type().is_capture_main())
            .unwrap_or(&self.records[0])
    }

    pub fn records(&self) -> &[WarcRecord<OwnedBody>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<WarcRecord<OwnedBody>> {
        self.records
    }

    pub fn request(&self) -> Option<&WarcRecord<OwnedBody>> {
        self.find(WarcType::Request)
    }

    pub fn metadata(&self) -> Option<&WarcRecord<OwnedBody>> {
        self.find(WarcType::Metadata)
    }

    fn find(&self, warc_type: WarcType) -> Option<&WarcRecord<OwnedBody>> {
        self.records.iter().find(|r| r.warc_type() == warc_type)
    }

    pub fn target_uri(&self) -> Option<&str> {
        self.main().target_uri()
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.main().date()
    }

    /// Id of the warcinfo record in force when this capture was read.
    pub fn warcinfo_id(&self) -> Option<&Url> {
        self.warcinfo_id.as_ref()
    }
}

/// Groups a file's records into capture events.
pub struct CaptureReader {
    reader: WarcReader,
    pending: Option<WarcRecord<OwnedBody>>,
    warcinfo: Option<WarcRecord<OwnedBody>>,
}

impl CaptureReader {
    pub fn new(reader: WarcReader) -> Self {
        CaptureReader {
            reader,
            pending: None,
            warcinfo: None,
        }
    }

    /// The next capture event, or `None` at the end of the file.
    pub fn next(&mut self) -> Result<Option<WarcCapture>> {
        let mut set = ConcurrentRecordSet::new();
        let mut records = Vec::new();
        loop {
            let record = match self.pending.take() {
                Some(record) => record,
                None => match self.read_capture_member()? {
                    Some(record) => record,
                    None => break,
                },
            };
            if !records.is_empty() && !set.contains(&record) {
                self.pending = Some(record);
                break;
            }
            set.add(&record);
            records.push(record);
        }
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(WarcCapture {
            records,
            warcinfo_id: self.warcinfo.as_ref().and_then(|r| r.id()),
        }))
    }

    /// The warcinfo record most recently seen, which describes the file
    /// the subsequent captures came from.
    pub fn warcinfo(&self) -> Option<&WarcRecord<OwnedBody>> {
        self.warcinfo.as_ref()
    }

    /// Repositions to a record boundary. Forgets the buffered record and
    /// any warcinfo seen so far.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.reader.seek(offset)?;
        self.pending = None;
        self.warcinfo = None;
        Ok(())
    }

    /// Reads forward to the next request, response, resource, metadata or
    /// revisit record, remembering warcinfo records along the way.
    fn read_capture_member(&mut self) -> Result<Option<WarcRecord<OwnedBody>>> {
        loop {
            let Some(record) = self.reader.next()? else {
                return Ok(None);
            };
            let warc_type = record.warc_type();
            if warc_type == WarcType::Warcinfo {
                self.warcinfo = Some(record.into_owned()?);
                continue;
            }
            if !warc_type.is_capture_member() {
                continue;
            }
            return Ok(Some(record.into_owned()?));
        }
    }
}

// ── Segmentation ──────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("continuation record without WARC-Segment-Origin-ID")]
    MissingOrigin,
    #[error("continuation for unknown origin record {0}")]
    UnknownOrigin(Url),
    #[error("expected segment {expected} of {origin}, got {got}")]
    OutOfOrder { origin: Url, expected: u64, got: u64 },
    #[error("first segment record without a record id")]
    MissingId,
}

struct PendingSegments {
    first: WarcRecord<OwnedBody>,
    body: Vec<u8>,
    next_segment: u64,
}

/// Reassembles segmented records.
///
/// Records pass through `push` unchanged unless they take part in
/// segmentation. A record with `WARC-Segment-Number: 1` opens a pending
/// entry keyed by its id; continuation records append to it; the
/// continuation carrying `WARC-Segment-Total-Length` completes it and the
/// logical record is returned with the segmentation headers removed.
pub struct SegmentAssembler {
    pending: HashMap<Url, PendingSegments>,
}

impl SegmentAssembler {
    pub fn new() -> Self {
        SegmentAssembler {
            pending: HashMap::new(),
        }
    }

    pub fn push(
        &mut self,
        mut record: WarcRecord<OwnedBody>,
    ) -> Result<Option<WarcRecord<OwnedBody>>> {
        if record.warc_type() == WarcType::Continuation {
            return self.push_continuation(record);
        }
        if record.segment_number() == Some(1) {
            let id = record.id().ok_or(SegmentError::MissingId)?;
            let mut body = Vec::new();
            record.body_mut().read_to_end(&mut body)?;
            self.pending.insert(
                id,
                PendingSegments {
                    first: record,
                    body,
                    next_segment: 2,
                },
            );
            return Ok(None);
        }
        Ok(Some(record))
    }

    fn push_continuation(
        &mut self,
        mut record: WarcRecord<OwnedBody>,
    ) -> Result<Option<WarcRecord<OwnedBody>>> {
        let origin = record.segment_origin_id().ok_or(SegmentError::MissingOrigin)?;
        let entry = self
            .pending
            .get_mut(&origin)
            .ok_or_else(|| SegmentError::UnknownOrigin(origin.clone()))?;
        let number = record.segment_number().unwrap_or(0);
        if number != entry.next_segment {
            return Err(SegmentError::OutOfOrder {
                origin,
                expected: entry.next_segment,
                got: number,
            }
            .into());
        }
        record.body_mut().read_to_end(&mut entry.body)?;
        entry.next_segment += 1;

        let total = record.segment_total_length();
        if let Some(total) = total {
            let entry = self
                .pending
                .remove(&origin)
                .ok_or_else(|| SegmentError::UnknownOrigin(origin.clone()))?;
            if entry.body.len() as u64 != total {
                warn!(
                    origin = %origin,
                    declared = total,
                    actual = entry.body.len(),
                    "segment total length mismatch"
                );
            }
            return Ok(Some(reassemble(entry.first, entry.body)));
        }
        Ok(None)
    }

    /// Origin ids of records whose continuations never completed.
    pub fn incomplete(&self) -> Vec<&Url> {
        self.pending.keys().collect()
    }
}

impl Default for SegmentAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn reassemble(mut first: WarcRecord<OwnedBody>, body: Vec<u8>) -> WarcRecord<OwnedBody> {
    let headers = first.headers_mut();
    headers.remove("WARC-Segment-Number");
    headers.remove("WARC-Segment-Total-Length");
    // The block digest covered only the first segment's block. The payload
    // digest covers the whole logical payload, so it stays.
    headers.remove("WARC-Block-Digest");
    headers.set(
        crate::headers::HeaderName::new_unchecked("Content-Length"),
        body.len().to_string(),
    );
    first.map_body(|_| OwnedBody::from_bytes(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Compression;
    use crate::record::WarcBuilder;
    use crate::writer::WarcWriter;
    use std::io::Cursor;

    fn capture_file() -> Vec<u8> {
        let mut writer = WarcWriter::new(Vec::new(), Compression::None).unwrap();
        let mut warcinfo = WarcBuilder::new(WarcType::Warcinfo)
            .body("application/warc-fields", b"software: warckit\r\n".to_vec())
            .build()
            .unwrap();
        writer.write(&mut warcinfo).unwrap();

        for target in ["http://example.org/", "http://example.org/other"] {
            let mut response = WarcBuilder::new(WarcType::Response)
                .target_uri(target)
                .body("application/http;msgtype=response", b"HTTP/1.0 200 OK\r\n\r\n".to_vec())
                .build()
                .unwrap();
            let response_id = response.id().unwrap();
            writer.write(&mut response).unwrap();

            let mut request = WarcBuilder::new(WarcType::Request)
                .target_uri(target)
                .concurrent_to(&response_id)
                .body("application/http;msgtype=request", b"GET / HTTP/1.0\r\n\r\n".to_vec())
                .build()
                .unwrap();
            writer.write(&mut request).unwrap();

            let mut metadata = WarcBuilder::new(WarcType::Metadata)
                .concurrent_to(&response_id)
                .body("application/warc-fields", b"fetchTimeMs: 32\r\n".to_vec())
                .build()
                .unwrap();
            writer.write(&mut metadata).unwrap();
        }
        writer.into_inner().unwrap()
    }

    #[test]
    fn groups_concurrent_records() {
        let data = capture_file();
        let reader = WarcReader::new(Cursor::new(data)).unwrap();
        let mut captures = CaptureReader::new(reader);

        let capture = captures.next().unwrap().unwrap();
        assert_eq!(capture.records().len(), 3);
        assert_eq!(capture.main().warc_type(), WarcType::Response);
        assert_eq!(capture.target_uri(), Some("http://example.org/"));
        assert!(capture.request().is_some());
        assert!(capture.metadata().is_some());
        assert_eq!(
            capture.warcinfo_id(),
            captures.warcinfo().unwrap().id().as_ref()
        );

        let capture = captures.next().unwrap().unwrap();
        assert_eq!(capture.target_uri(), Some("http://example.org/other"));
        assert_eq!(capture.records().len(), 3);

        assert!(captures.next().unwrap().is_none());
    }

    #[test]
    fn groups_when_request_precedes_response() {
        // Some crawlers write the request and its metadata before the
        // response they belong to; the links still tie them together.
        let mut writer = WarcWriter::new(Vec::new(), Compression::None).unwrap();
        let mut warcinfo = WarcBuilder::new(WarcType::Warcinfo)
            .body("application/warc-fields", b"software: warckit\r\n".to_vec())
            .build()
            .unwrap();
        writer.write(&mut warcinfo).unwrap();

        let mut request = WarcBuilder::new(WarcType::Request)
            .target_uri("http://example.org/")
            .body("application/http;msgtype=request", b"GET / HTTP/1.0\r\n\r\n".to_vec())
            .build()
            .unwrap();
        let request_id = request.id().unwrap();
        writer.write(&mut request).unwrap();

        let mut metadata = WarcBuilder::new(WarcType::Metadata)
            .concurrent_to(&request_id)
            .body("application/warc-fields", b"fetchTimeMs: 32\r\n".to_vec())
            .build()
            .unwrap();
        writer.write(&mut metadata).unwrap();

        let mut response = WarcBuilder::new(WarcType::Response)
            .target_uri("http://example.org/")
            .concurrent_to(&request_id)
            .body("application/http;msgtype=response", b"HTTP/1.0 200 OK\r\n\r\n".to_vec())
            .build()
            .unwrap();
        writer.write(&mut response).unwrap();

        let data = writer.into_inner().unwrap();
        let reader = WarcReader::new(Cursor::new(data)).unwrap();
        let mut captures = CaptureReader::new(reader);

        let capture = captures.next().unwrap().unwrap();
        assert_eq!(capture.records().len(), 3);
        assert_eq!(capture.records()[0].warc_type(), WarcType::Request);
        assert_eq!(capture.main().warc_type(), WarcType::Response);
        assert_eq!(capture.target_uri(), Some("http://example.org/"));
        assert!(captures.next().unwrap().is_none());
    }

    #[test]
    fn capture_closes_on_unrelated_record() {
        // Two bare responses with no links between them.
        let mut writer = WarcWriter::new(Vec::new(), Compression::None).unwrap();
        for target in ["http://example.org/a", "http://example.org/b"] {
            let mut record = WarcBuilder::new(WarcType::Response)
                .target_uri(target)
                .build()
                .unwrap();
            writer.write(&mut record).unwrap();
        }
        let data = writer.into_inner().unwrap();
        let reader = WarcReader::new(Cursor::new(data)).unwrap();
        let mut captures = CaptureReader::new(reader);
        assert_eq!(captures.next().unwrap().unwrap().records().len(), 1);
        assert_eq!(captures.next().unwrap().unwrap().records().len(), 1);
        assert!(captures.next().unwrap().is_none());
    }

    #[test]
    fn concurrent_set_links_both_directions() {
        let first = WarcBuilder::new(WarcType::Response)
            .target_uri("http://example.org/")
            .build()
            .unwrap();
        let later = WarcBuilder::new(WarcType::Metadata)
            .concurrent_to(&first.id().unwrap())
            .build()
            .unwrap();
        let unrelated = WarcBuilder::new(WarcType::Response)
            .target_uri("http://example.org/other")
            .build()
            .unwrap();

        let mut set = ConcurrentRecordSet::new();
        set.add(&first);
        assert!(set.contains(&later));
        assert!(!set.contains(&unrelated));
        set.clear();
        assert!(!set.contains(&later));
    }

    fn segmented_records(body: &[u8], split: usize) -> Vec<WarcRecord<OwnedBody>> {
        let (head, tail) = body.split_at(split);
        let first = WarcBuilder::new(WarcType::Response)
            .target_uri("http://example.org/big")
            .segment_number(1)
            .body("application/http;msgtype=response", head.to_vec())
            .build()
            .unwrap();
        let continuation = WarcBuilder::new(WarcType::Continuation)
            .target_uri("http://example.org/big")
            .segment_number(2)
            .segment_origin_id(&first.id().unwrap())
            .segment_total_length(body.len() as u64)
            .body("application/octet-stream", tail.to_vec())
            .build()
            .unwrap();
        vec![first, continuation]
    }

    #[test]
    fn reassembles_segments() {
        let body = b"HTTP/1.0 200 OK\r\n\r\na response big enough to split";
        let mut assembler = SegmentAssembler::new();
        let mut records = segmented_records(body, 20).into_iter();

        assert!(assembler.push(records.next().unwrap()).unwrap().is_none());
        assert_eq!(assembler.incomplete().len(), 1);
        let whole = assembler.push(records.next().unwrap()).unwrap().unwrap();

        assert_eq!(whole.warc_type(), WarcType::Response);
        assert_eq!(whole.content_length(), body.len() as u64);
        assert_eq!(whole.body().as_bytes(), Some(&body[..]));
        assert!(whole.segment_number().is_none());
        assert!(whole.headers().first("WARC-Segment-Total-Length").is_none());
        assert!(assembler.incomplete().is_empty());
    }

    #[test]
    fn continuation_for_unknown_origin_rejected() {
        let body = b"0123456789abcdef";
        let mut records = segmented_records(body, 8).into_iter();
        records.next();
        let mut assembler = SegmentAssembler::new();
        assert!(assembler.push(records.next().unwrap()).is_err());
    }

    #[test]
    fn out_of_order_segment_rejected() {
        let body = b"0123456789abcdef";
        let mut records = segmented_records(body, 8);
        let continuation = records.pop().unwrap();
        let first = records.pop().unwrap();
        let origin = first.id().unwrap();

        let mut assembler = SegmentAssembler::new();
        assembler.push(first).unwrap();
        // Skip segment 2 by renumbering the continuation to 4.
        let mut continuation = continuation;
        continuation.headers_mut().set(
            crate::headers::HeaderName::new_unchecked("WARC-Segment-Number"),
            "4",
        );
        let err = assembler.push(continuation).unwrap_err();
        assert!(err.to_string().contains(&origin.to_string()));
    }
}
