//! The framed trace object stored as a block record's bytes.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! [u8  format version = 1]
//! [u16 encoding tag length][tag bytes]
//! [u64 start unix nanos][u64 end unix nanos]
//! [u8  error flag]
//! [u16 root service length][bytes]
//! [u16 root span name length][bytes]
//! [u32 tag pair count] count * ([u16 key len][key][u16 value len][value])
//! [u32 span count]     count * ([u32 span len][opaque span bytes])
//! ```
//!
//! The summary header comes first so search can evaluate predicates after
//! decoding only the header, never touching the opaque span payloads.

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use data_types::{BlockId, DataEncoding, TraceAttributes, TraceId};

use crate::{Error, Result};

const FORMAT_VERSION: u8 = 1;

/// A decoded trace object: the attribute rollup plus the opaque span
/// payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceObject {
    /// Rolled-up attributes for search.
    pub attributes: TraceAttributes,

    /// Encoding tag of the span payloads.
    pub encoding: DataEncoding,

    /// The opaque span payloads, in stored order.
    pub spans: Vec<Bytes>,
}

impl TraceObject {
    /// Serialise to the record byte form.
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::new();
        out.push(FORMAT_VERSION);
        put_str16(&mut out, self.encoding.as_str());
        put_u64(&mut out, self.attributes.start_unix_nanos);
        put_u64(&mut out, self.attributes.end_unix_nanos);
        out.push(u8::from(self.attributes.error));
        put_str16(&mut out, &self.attributes.root_service_name);
        put_str16(&mut out, &self.attributes.root_span_name);

        put_u32(&mut out, self.attributes.tags.len() as u32);
        for (k, v) in &self.attributes.tags {
            put_str16(&mut out, k);
            put_str16(&mut out, v);
        }

        put_u32(&mut out, self.spans.len() as u32);
        for span in &self.spans {
            put_u32(&mut out, span.len() as u32);
            out.extend_from_slice(span);
        }
        Bytes::from(out)
    }

    /// Decode a full trace object.
    pub fn decode(raw: &Bytes, block_id: BlockId) -> Result<Self> {
        let mut cursor = Cursor::new(raw, block_id);
        let (attributes, encoding) = cursor.read_summary()?;

        let span_count = cursor.read_u32()?;
        let mut spans = Vec::with_capacity(span_count as usize);
        for _ in 0..span_count {
            let len = cursor.read_u32()? as usize;
            spans.push(cursor.read_bytes(len)?);
        }

        Ok(Self {
            attributes,
            encoding,
            spans,
        })
    }

    /// Decode only the summary header, skipping the span payloads entirely.
    pub fn decode_summary(raw: &Bytes, block_id: BlockId) -> Result<(TraceAttributes, DataEncoding)> {
        Cursor::new(raw, block_id).read_summary()
    }

    /// Merge two encoded trace objects under the same trace id: attribute
    /// rollups union, span lists concatenate in argument order (making the
    /// merge deterministic given the same inputs).
    pub fn merge(a: &Bytes, b: &Bytes, trace_id: TraceId, block_id: BlockId) -> Result<Bytes> {
        let mut left = Self::decode(a, block_id)?;
        let right = Self::decode(b, block_id)?;

        if left.encoding != right.encoding {
            return Err(Error::CorruptBlock {
                block_id,
                reason: format!(
                    "trace {trace_id} stored with conflicting encodings {} and {}",
                    left.encoding, right.encoding
                ),
            });
        }

        left.attributes.merge(&right.attributes);
        left.spans.extend(right.spans);
        Ok(left.encode())
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, v);
    out.extend_from_slice(&buf);
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, v);
    out.extend_from_slice(&buf);
}

fn put_str16(out: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, s.len() as u16);
    out.extend_from_slice(&buf);
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    raw: &'a Bytes,
    at: usize,
    block_id: BlockId,
}

impl<'a> Cursor<'a> {
    fn new(raw: &'a Bytes, block_id: BlockId) -> Self {
        Self {
            raw,
            at: 0,
            block_id,
        }
    }

    fn corrupt(&self, reason: &str) -> Error {
        Error::CorruptBlock {
            block_id: self.block_id,
            reason: format!("trace object: {reason}"),
        }
    }

    fn read_summary(&mut self) -> Result<(TraceAttributes, DataEncoding)> {
        let version = self.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(self.corrupt(&format!("unknown format version {version}")));
        }

        let encoding = DataEncoding::new(self.read_str16()?);
        let start_unix_nanos = self.read_u64()?;
        let end_unix_nanos = self.read_u64()?;
        let error = self.read_u8()? != 0;
        let root_service_name = self.read_str16()?;
        let root_span_name = self.read_str16()?;

        let tag_count = self.read_u32()?;
        let mut tags = Vec::with_capacity(tag_count as usize);
        for _ in 0..tag_count {
            let k = self.read_str16()?;
            let v = self.read_str16()?;
            tags.push((k, v));
        }

        Ok((
            TraceAttributes {
                root_service_name,
                root_span_name,
                start_unix_nanos,
                end_unix_nanos,
                error,
                tags,
            },
            encoding,
        ))
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .raw
            .get(self.at)
            .ok_or_else(|| self.corrupt("truncated"))?;
        self.at += 1;
        Ok(b)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let s = self.slice(4)?;
        Ok(LittleEndian::read_u32(s))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let s = self.slice(8)?;
        Ok(LittleEndian::read_u64(s))
    }

    fn read_str16(&mut self) -> Result<String> {
        let len = {
            let s = self.slice(2)?;
            LittleEndian::read_u16(s) as usize
        };
        let s = self.slice(len)?;
        String::from_utf8(s.to_vec()).map_err(|_| self.corrupt("string not utf-8"))
    }

    fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        let end = self
            .at
            .checked_add(len)
            .filter(|end| *end <= self.raw.len())
            .ok_or_else(|| self.corrupt("truncated"))?;
        let bytes = self.raw.slice(self.at..end);
        self.at = end;
        Ok(bytes)
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .at
            .checked_add(len)
            .filter(|end| *end <= self.raw.len())
            .ok_or_else(|| self.corrupt("truncated"))?;
        let s = &self.raw[self.at..end];
        self.at = end;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracedb_time::Time;

    fn block_id() -> BlockId {
        BlockId::new_at(Time::from_timestamp_millis(0))
    }

    fn object(spans: &[&[u8]], start: u64) -> TraceObject {
        TraceObject {
            attributes: TraceAttributes {
                root_service_name: "front".into(),
                root_span_name: "GET /".into(),
                start_unix_nanos: start,
                end_unix_nanos: start + 700_000_000,
                error: false,
                tags: vec![("service.name".into(), "front".into())],
            },
            encoding: DataEncoding::default(),
            spans: spans.iter().map(|s| Bytes::copy_from_slice(s)).collect(),
        }
    }

    #[test]
    fn full_round_trip() {
        let obj = object(&[b"alpha", b"beta"], 100);
        let encoded = obj.encode();
        assert_eq!(TraceObject::decode(&encoded, block_id()).unwrap(), obj);
    }

    #[test]
    fn summary_decode_matches_full_decode() {
        let obj = object(&[b"alpha"], 100);
        let encoded = obj.encode();
        let (attrs, encoding) = TraceObject::decode_summary(&encoded, block_id()).unwrap();
        assert_eq!(attrs, obj.attributes);
        assert_eq!(encoding, obj.encoding);
    }

    #[test]
    fn merge_concatenates_spans_and_unions_attributes() {
        let a = object(&[b"alpha"], 200).encode();
        let b = object(&[b"beta"], 100).encode();
        let id = TraceId::from_bytes([1; 16]);

        let merged = TraceObject::merge(&a, &b, id, block_id()).unwrap();
        let merged = TraceObject::decode(&merged, block_id()).unwrap();

        assert_eq!(merged.spans, vec![Bytes::from_static(b"alpha"), Bytes::from_static(b"beta")]);
        assert_eq!(merged.attributes.start_unix_nanos, 100);
        assert_eq!(merged.attributes.end_unix_nanos, 100 + 700_000_000 + 100);
        assert_eq!(merged.attributes.tags.len(), 1);
    }

    #[test]
    fn truncation_is_corruption() {
        let encoded = object(&[b"alpha"], 100).encode();
        let truncated = encoded.slice(..encoded.len() - 3);
        assert!(matches!(
            TraceObject::decode(&truncated, block_id()).unwrap_err(),
            Error::CorruptBlock { .. }
        ));
    }
}
