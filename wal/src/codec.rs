//! Framing of individual WAL records.
//!
//! Each record on disk is:
//!
//! ```text
//! [u32 LE  compressed length]
//! [u32 LE  crc32 of the compressed bytes]
//! [snappy-compressed payload]
//! ```
//!
//! where the uncompressed payload is the 16 byte trace id followed by the
//! opaque object bytes.

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use data_types::{TraceId, TRACE_ID_LEN};
use snafu::ResultExt;

use crate::{Error, Result, SegmentId, UnableToCompressRecordSnafu};

pub(crate) const RECORD_HEADER_LEN: usize = 8;

pub(crate) fn encode_record(trace_id: TraceId, payload: &[u8]) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(TRACE_ID_LEN + payload.len());
    raw.extend_from_slice(trace_id.as_bytes());
    raw.extend_from_slice(payload);

    let compressed = snap::raw::Encoder::new()
        .compress_vec(&raw)
        .context(UnableToCompressRecordSnafu)?;

    let mut out = vec![0u8; RECORD_HEADER_LEN];
    LittleEndian::write_u32(&mut out[0..4], compressed.len() as u32);
    LittleEndian::write_u32(&mut out[4..8], crc32fast::hash(&compressed));
    out.extend_from_slice(&compressed);
    Ok(out)
}

pub(crate) fn read_header(header: &[u8; RECORD_HEADER_LEN]) -> (u32, u32) {
    (
        LittleEndian::read_u32(&header[0..4]),
        LittleEndian::read_u32(&header[4..8]),
    )
}

pub(crate) fn decode_record(
    compressed: &[u8],
    expected_crc: u32,
    segment: SegmentId,
    offset: u64,
) -> Result<(TraceId, Bytes)> {
    let actual = crc32fast::hash(compressed);
    if actual != expected_crc {
        return Err(Error::CorruptRecord {
            segment,
            offset,
            reason: format!("crc mismatch: expected {expected_crc:#010x}, got {actual:#010x}"),
        });
    }

    let raw = snap::raw::Decoder::new()
        .decompress_vec(compressed)
        .map_err(|e| Error::CorruptRecord {
            segment,
            offset,
            reason: format!("decompression failed: {e}"),
        })?;

    if raw.len() < TRACE_ID_LEN {
        return Err(Error::CorruptRecord {
            segment,
            offset,
            reason: format!("record shorter than a trace id: {} bytes", raw.len()),
        });
    }

    let mut id = [0u8; TRACE_ID_LEN];
    id.copy_from_slice(&raw[..TRACE_ID_LEN]);
    let payload = Bytes::copy_from_slice(&raw[TRACE_ID_LEN..]);
    Ok((TraceId::from_bytes(id), payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let id = TraceId::from_bytes([7; 16]);
        let encoded = encode_record(id, b"span bytes").unwrap();

        let mut header = [0u8; RECORD_HEADER_LEN];
        header.copy_from_slice(&encoded[..RECORD_HEADER_LEN]);
        let (len, crc) = read_header(&header);
        assert_eq!(len as usize, encoded.len() - RECORD_HEADER_LEN);

        let (got_id, got_payload) = decode_record(
            &encoded[RECORD_HEADER_LEN..],
            crc,
            SegmentId::new(0),
            0,
        )
        .unwrap();
        assert_eq!(got_id, id);
        assert_eq!(&got_payload[..], b"span bytes");
    }

    #[test]
    fn crc_mismatch_is_corruption() {
        let encoded = encode_record(TraceId::from_bytes([1; 16]), b"x").unwrap();
        let err = decode_record(
            &encoded[RECORD_HEADER_LEN..],
            0xbad_c0de,
            SegmentId::new(3),
            42,
        )
        .unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { offset: 42, .. }));
    }
}
