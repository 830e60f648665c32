//! Encoding and decoding of data pages.
//!
//! One page is, after optional decompression of everything but the final
//! byte:
//!
//! ```text
//! [uvarint record count]
//! count * [u32 LE id len][id bytes][u32 LE object len][object bytes]
//! ```
//!
//! followed by one trailing codec byte describing how the region before it
//! is compressed. The trailing position lets the writer stream the record
//! region before deciding its compressed length.

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use data_types::{BlockId, TraceId, TRACE_ID_LEN};

use crate::{Error, PageCodec, Result};

pub(crate) fn write_uvarint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut v: u64 = 0;
    for (i, byte) in buf.iter().enumerate().take(10) {
        v |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((v, i + 1));
        }
    }
    None
}

/// Encode `records` into one page, applying `codec`.
pub(crate) fn encode_page(records: &[(TraceId, Bytes)], codec: PageCodec) -> Result<Vec<u8>> {
    let mut region = Vec::new();
    write_uvarint(&mut region, records.len() as u64);
    for (id, object) in records {
        let mut lens = [0u8; 4];
        LittleEndian::write_u32(&mut lens, TRACE_ID_LEN as u32);
        region.extend_from_slice(&lens);
        region.extend_from_slice(id.as_bytes());
        LittleEndian::write_u32(&mut lens, object.len() as u32);
        region.extend_from_slice(&lens);
        region.extend_from_slice(object);
    }

    let mut out = match codec {
        PageCodec::None => region,
        PageCodec::Snappy => snap::raw::Encoder::new()
            .compress_vec(&region)
            .expect("snappy compression of an in-memory buffer cannot fail"),
    };
    out.push(codec.to_byte());
    Ok(out)
}

/// Decode one page previously produced by [`encode_page`].
pub(crate) fn decode_page(page: &[u8], block_id: BlockId) -> Result<Vec<(TraceId, Bytes)>> {
    let corrupt = |reason: String| Error::CorruptBlock { block_id, reason };

    let (&codec_byte, region) = page
        .split_last()
        .ok_or_else(|| corrupt("empty page".into()))?;
    let codec = PageCodec::from_byte(codec_byte)
        .ok_or_else(|| corrupt(format!("unknown page codec {codec_byte}")))?;

    let raw;
    let region: &[u8] = match codec {
        PageCodec::None => region,
        PageCodec::Snappy => {
            raw = snap::raw::Decoder::new()
                .decompress_vec(region)
                .map_err(|e| corrupt(format!("page decompression failed: {e}")))?;
            &raw
        }
    };

    let (count, mut at) =
        read_uvarint(region).ok_or_else(|| corrupt("truncated record count".into()))?;

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id_len = read_u32(region, &mut at).ok_or_else(|| corrupt("truncated id length".into()))?;
        if id_len as usize != TRACE_ID_LEN {
            return Err(corrupt(format!("unexpected trace id length {id_len}")));
        }
        let id_bytes = take(region, &mut at, TRACE_ID_LEN)
            .ok_or_else(|| corrupt("truncated trace id".into()))?;
        let mut id = [0u8; TRACE_ID_LEN];
        id.copy_from_slice(id_bytes);

        let obj_len =
            read_u32(region, &mut at).ok_or_else(|| corrupt("truncated object length".into()))?;
        let object = take(region, &mut at, obj_len as usize)
            .ok_or_else(|| corrupt("truncated object bytes".into()))?;

        records.push((TraceId::from_bytes(id), Bytes::copy_from_slice(object)));
    }
    Ok(records)
}

fn read_u32(buf: &[u8], at: &mut usize) -> Option<u32> {
    let bytes = take(buf, at, 4)?;
    Some(LittleEndian::read_u32(bytes))
}

fn take<'a>(buf: &'a [u8], at: &mut usize, n: usize) -> Option<&'a [u8]> {
    let end = at.checked_add(n)?;
    if end > buf.len() {
        return None;
    }
    let slice = &buf[*at..end];
    *at = end;
    Some(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracedb_time::Time;

    fn id(b: u8) -> TraceId {
        TraceId::from_bytes([b; 16])
    }

    fn block_id() -> BlockId {
        BlockId::new_at(Time::from_timestamp_millis(0))
    }

    #[test]
    fn uvarint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_uvarint(&mut buf, v);
            let (got, used) = read_uvarint(&buf).unwrap();
            assert_eq!(got, v);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn page_round_trip_both_codecs() {
        let records = vec![
            (id(1), Bytes::from_static(b"alpha")),
            (id(2), Bytes::from_static(b"")),
            (id(3), Bytes::from(vec![0u8; 10_000])),
        ];

        for codec in [PageCodec::None, PageCodec::Snappy] {
            let encoded = encode_page(&records, codec).unwrap();
            assert_eq!(*encoded.last().unwrap(), codec.to_byte());
            let decoded = decode_page(&encoded, block_id()).unwrap();
            assert_eq!(decoded, records);
        }
    }

    #[test]
    fn truncated_page_is_corruption() {
        let records = vec![(id(1), Bytes::from_static(b"alpha"))];
        let encoded = encode_page(&records, PageCodec::None).unwrap();

        // Chop out the middle, keep the codec byte at the end.
        let mut broken = encoded[..encoded.len() / 2].to_vec();
        broken.push(PageCodec::None.to_byte());
        let err = decode_page(&broken, block_id()).unwrap_err();
        assert!(matches!(err, Error::CorruptBlock { .. }));
    }
}
