//! Entry envelope codec.
//!
//! File and networked backends persist entries as a small self-describing
//! binary frame: version byte, flag byte, timestamps, optional version tag,
//! then the payload. Payloads above the configured threshold are
//! zlib-compressed before framing when compression buys anything; raw
//! counter entries are never framed or compressed.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use time::OffsetDateTime;

use crate::entry::CacheEntry;
use crate::error::CacheError;

const ENVELOPE_VERSION: u8 = 1;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_RAW: u8 = 0b0000_0010;
const FLAG_HAS_EXPIRY: u8 = 0b0000_0100;
const FLAG_HAS_VERSION: u8 = 0b0000_1000;

/// Fixed portion of the frame: version, flags, created_at. Expiry adds
/// another 16 bytes, a version tag 2 + len.
const FIXED_HEADER_BYTES: usize = 1 + 1 + 16;

/// Compress `payload` if it clears `threshold` and compression actually
/// shrinks it. Returns the stored form and whether it is compressed.
pub(crate) fn compress_payload(
    payload: Bytes,
    threshold: usize,
) -> Result<(Bytes, bool), CacheError> {
    if payload.len() < threshold {
        return Ok((payload, false));
    }
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
    encoder
        .write_all(&payload)
        .map_err(|e| CacheError::serialization(format!("compress failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CacheError::serialization(format!("compress failed: {e}")))?;
    if compressed.len() >= payload.len() {
        // Incompressible payload, store as written.
        return Ok((payload, false));
    }
    Ok((Bytes::from(compressed), true))
}

pub(crate) fn decompress_payload(payload: &[u8]) -> Result<Bytes, CacheError> {
    let mut decoder = ZlibDecoder::new(payload);
    let mut out = Vec::with_capacity(payload.len() * 4);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CacheError::serialization(format!("decompress failed: {e}")))?;
    Ok(Bytes::from(out))
}

/// Frame an entry for a byte-oriented backend.
pub(crate) fn encode_envelope(entry: &CacheEntry) -> Bytes {
    let version_tag = entry.version().map(str::as_bytes);
    let mut flags = 0u8;
    if entry.is_compressed() {
        flags |= FLAG_COMPRESSED;
    }
    if entry.is_raw() {
        flags |= FLAG_RAW;
    }
    if entry.expires_at().is_some() {
        flags |= FLAG_HAS_EXPIRY;
    }
    if version_tag.is_some() {
        flags |= FLAG_HAS_VERSION;
    }

    let capacity = FIXED_HEADER_BYTES
        + 16
        + version_tag.map_or(0, |v| 2 + v.len())
        + entry.payload().len();
    let mut buf = BytesMut::with_capacity(capacity);
    buf.put_u8(ENVELOPE_VERSION);
    buf.put_u8(flags);
    buf.put_i128(entry.created_at().unix_timestamp_nanos());
    if let Some(expires_at) = entry.expires_at() {
        buf.put_i128(expires_at.unix_timestamp_nanos());
    }
    if let Some(tag) = version_tag {
        buf.put_u16(tag.len() as u16);
        buf.put_slice(tag);
    }
    buf.put_slice(entry.payload());
    buf.freeze()
}

/// Decode a frame produced by [`encode_envelope`]. The payload is returned
/// in its stored form; the compressed flag tells the value layer whether to
/// inflate before deserializing.
pub(crate) fn decode_envelope(mut frame: Bytes) -> Result<CacheEntry, CacheError> {
    if frame.remaining() < FIXED_HEADER_BYTES {
        return Err(CacheError::serialization("envelope truncated"));
    }
    let version = frame.get_u8();
    if version != ENVELOPE_VERSION {
        return Err(CacheError::serialization(format!(
            "unknown envelope version {version}"
        )));
    }
    let flags = frame.get_u8();
    let created_at = read_timestamp(&mut frame, "created_at")?;

    let expires_at = if flags & FLAG_HAS_EXPIRY != 0 {
        if frame.remaining() < 16 {
            return Err(CacheError::serialization("envelope truncated at expiry"));
        }
        Some(read_timestamp(&mut frame, "expires_at")?)
    } else {
        None
    };

    let version_tag = if flags & FLAG_HAS_VERSION != 0 {
        if frame.remaining() < 2 {
            return Err(CacheError::serialization("envelope truncated at version tag"));
        }
        let len = frame.get_u16() as usize;
        if frame.remaining() < len {
            return Err(CacheError::serialization("envelope truncated at version tag"));
        }
        let tag = frame.split_to(len);
        Some(
            String::from_utf8(tag.to_vec())
                .map_err(|_| CacheError::serialization("version tag is not utf-8"))?,
        )
    } else {
        None
    };

    Ok(CacheEntry::from_parts(
        frame,
        created_at,
        expires_at,
        version_tag,
        flags & FLAG_COMPRESSED != 0,
        flags & FLAG_RAW != 0,
    ))
}

fn read_timestamp(frame: &mut Bytes, field: &str) -> Result<OffsetDateTime, CacheError> {
    OffsetDateTime::from_unix_timestamp_nanos(frame.get_i128())
        .map_err(|_| CacheError::serialization(format!("{field} out of range")))
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn envelope_round_trips_all_fields() {
        let expires = datetime!(2024-07-01 00:00:00 UTC);
        let entry = CacheEntry::new(
            Bytes::from_static(b"hello world"),
            Some(expires),
            Some("v3".to_owned()),
        );
        let decoded = decode_envelope(encode_envelope(&entry)).unwrap();
        assert_eq!(decoded.payload(), entry.payload());
        assert_eq!(decoded.expires_at(), Some(expires));
        assert_eq!(decoded.version(), Some("v3"));
        assert_eq!(decoded.created_at(), entry.created_at());
        assert!(!decoded.is_compressed());
        assert!(!decoded.is_raw());
    }

    #[test]
    fn envelope_round_trips_minimal_entry() {
        let entry = CacheEntry::new(Bytes::from_static(b""), None, None);
        let decoded = decode_envelope(encode_envelope(&entry)).unwrap();
        assert!(decoded.payload().is_empty());
        assert_eq!(decoded.expires_at(), None);
        assert_eq!(decoded.version(), None);
    }

    #[test]
    fn raw_flag_survives_framing() {
        let entry = CacheEntry::raw(Bytes::from_static(b"42"), None);
        let decoded = decode_envelope(encode_envelope(&entry)).unwrap();
        assert!(decoded.is_raw());
        assert_eq!(decoded.payload().as_ref(), b"42");
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let entry = CacheEntry::new(
            Bytes::from_static(b"payload"),
            Some(datetime!(2024-07-01 00:00:00 UTC)),
            Some("tag".to_owned()),
        );
        let frame = encode_envelope(&entry);
        for cut in [0, 1, 5, FIXED_HEADER_BYTES + 3] {
            let err = decode_envelope(frame.slice(..cut)).unwrap_err();
            assert!(matches!(err, CacheError::Serialization { .. }), "cut at {cut}");
        }
    }

    #[test]
    fn unknown_envelope_version_is_rejected() {
        let entry = CacheEntry::new(Bytes::from_static(b"x"), None, None);
        let mut frame = encode_envelope(&entry).to_vec();
        frame[0] = 9;
        assert!(decode_envelope(Bytes::from(frame)).is_err());
    }

    #[test]
    fn small_payloads_skip_compression() {
        let payload = Bytes::from_static(b"tiny");
        let (stored, compressed) = compress_payload(payload.clone(), 1024).unwrap();
        assert!(!compressed);
        assert_eq!(stored, payload);
    }

    #[test]
    fn large_repetitive_payloads_compress() {
        let payload = Bytes::from(vec![b'a'; 64 * 1024]);
        let (stored, compressed) = compress_payload(payload.clone(), 16 * 1024).unwrap();
        assert!(compressed);
        assert!(stored.len() < payload.len());
        assert_eq!(decompress_payload(&stored).unwrap(), payload);
    }

    #[test]
    fn incompressible_payloads_stay_uncompressed() {
        // Pseudo-random bytes, already high entropy.
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let payload: Vec<u8> = (0..32 * 1024)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        let payload = Bytes::from(payload);
        let (stored, compressed) = compress_payload(payload.clone(), 1024).unwrap();
        assert!(!compressed);
        assert_eq!(stored, payload);
    }
}
