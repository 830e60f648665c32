//! Framing of one span entry as it is stored in a WAL record's payload.
//!
//! The WAL keys records by trace id; the payload carries everything else the
//! head block needs to be rebuilt on replay: the opaque span bytes, the
//! encoding tag, and the pre-extracted attributes.

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use data_types::{DataEncoding, SpanAttributes};

const ENTRY_VERSION: u8 = 1;

pub(crate) fn encode_span_entry(
    payload: &Bytes,
    attributes: &SpanAttributes,
    encoding: &DataEncoding,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 64);
    out.push(ENTRY_VERSION);
    put_str16(&mut out, encoding.as_str());
    put_u64(&mut out, attributes.start_unix_nanos);
    put_u64(&mut out, attributes.duration_nanos);
    out.push(u8::from(attributes.error));
    put_str16(&mut out, &attributes.service_name);
    put_str16(&mut out, &attributes.span_name);
    put_u32(&mut out, attributes.tags.len() as u32);
    for (k, v) in &attributes.tags {
        put_str16(&mut out, k);
        put_str16(&mut out, v);
    }
    put_u32(&mut out, payload.len() as u32);
    out.extend_from_slice(payload);
    out
}

pub(crate) fn decode_span_entry(
    raw: &Bytes,
) -> Option<(Bytes, SpanAttributes, DataEncoding)> {
    let mut at = 0usize;
    if *raw.first()? != ENTRY_VERSION {
        return None;
    }
    at += 1;

    let encoding = DataEncoding::new(read_str16(raw, &mut at)?);
    let start_unix_nanos = read_u64(raw, &mut at)?;
    let duration_nanos = read_u64(raw, &mut at)?;
    let error = *raw.get(at)? != 0;
    at += 1;
    let service_name = read_str16(raw, &mut at)?;
    let span_name = read_str16(raw, &mut at)?;

    let tag_count = read_u32(raw, &mut at)?;
    let mut tags = Vec::with_capacity(tag_count as usize);
    for _ in 0..tag_count {
        let k = read_str16(raw, &mut at)?;
        let v = read_str16(raw, &mut at)?;
        tags.push((k, v));
    }

    let payload_len = read_u32(raw, &mut at)? as usize;
    let end = at.checked_add(payload_len)?;
    if end > raw.len() {
        return None;
    }
    let payload = raw.slice(at..end);

    Some((
        payload,
        SpanAttributes {
            service_name,
            span_name,
            start_unix_nanos,
            duration_nanos,
            error,
            tags,
        },
        encoding,
    ))
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
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, s.len().min(u16::MAX as usize) as u16);
    out.extend_from_slice(&buf);
    out.extend_from_slice(&s.as_bytes()[..s.len().min(u16::MAX as usize)]);
}

fn read_u32(raw: &Bytes, at: &mut usize) -> Option<u32> {
    let end = at.checked_add(4)?;
    if end > raw.len() {
        return None;
    }
    let v = LittleEndian::read_u32(&raw[*at..end]);
    *at = end;
    Some(v)
}

fn read_u64(raw: &Bytes, at: &mut usize) -> Option<u64> {
    let end = at.checked_add(8)?;
    if end > raw.len() {
        return None;
    }
    let v = LittleEndian::read_u64(&raw[*at..end]);
    *at = end;
    Some(v)
}

fn read_str16(raw: &Bytes, at: &mut usize) -> Option<String> {
    let end = at.checked_add(2)?;
    if end > raw.len() {
        return None;
    }
    let len = LittleEndian::read_u16(&raw[*at..end]) as usize;
    *at = end;
    let end = at.checked_add(len)?;
    if end > raw.len() {
        return None;
    }
    let s = String::from_utf8(raw[*at..end].to_vec()).ok()?;
    *at = end;
    Some(s)
}
