//! The resume state file: a versioned, checksummed snapshot of a torrent's
//! piece bitfield and transfer counters, so a restarted engine doesn't have
//! to re-verify (or re-download) everything from scratch.
//!
//! Layout (current version):
//!
//! ```text
//! offset  size  field
//! 0       4     magic "DTSF"
//! 4       4     version (u32 LE)
//! 8       20    info hash (20 byte handshake form; see InfoHash::handshake_hash)
//! 28      4     piece count (u32 LE)
//! 32      4     piece length (u32 LE)
//! 36      8     total length (u64 LE)
//! 44      8     uploaded bytes (u64 LE)
//! 52      8     last-modified timestamp, unix seconds (u64 LE)
//! 60      1     flags (bit 0: body is gzip-compressed; bit 1: sparse bitfield)
//! 61      1     compression level used, if compressed (0 otherwise)
//! 62      6     reserved, zero
//! 68      4     header CRC32 (over bytes 0..68)
//! 72      ..    body (dense packed bitfield, or sparse u32 LE index list),
//!               optionally gzip-compressed
//! ..      8     footer: uploaded bytes (u64 LE), repeated from the header
//!               so a reader can trust the cheaper-to-rewrite footer alone
//! ..      4     footer: CRC32 of the uncompressed body
//! ```
//!
//! A file that doesn't begin with the magic is assumed to be the legacy
//! format: the raw packed bitfield followed by an 8 byte LE uploaded
//! counter, with no version, flags, or checksums.

use std::io::{Read, Write};

use crc32fast::Hasher as Crc32;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::Bitfield;

const MAGIC: &[u8; 4] = b"DTSF";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 72;
const FOOTER_LEN: usize = 12;

const FLAG_COMPRESSED: u8 = 0b01;
const FLAG_SPARSE: u8 = 0b10;

/// Below this fraction of set bits, the sparse (index list) encoding is
/// smaller than the dense packed bitfield and is preferred.
const SPARSE_THRESHOLD: f64 = 0.10;
/// Hysteresis margin around the threshold: once encoded in one form, stay
/// there until popcount crosses the threshold by more than this, so a
/// torrent hovering near 10% complete doesn't flip encodings every save.
const HYSTERESIS: f64 = 0.02;

#[derive(Clone, Debug)]
pub(crate) struct StateFile {
    pub info_hash: [u8; 20],
    pub piece_count: usize,
    pub piece_len: u32,
    pub total_len: u64,
    pub uploaded_bytes: u64,
    pub last_modified: u64,
    pub bitfield: Bitfield,
}

impl StateFile {
    /// Serializes the state file, choosing the encoding (dense/sparse) and
    /// whether to gzip-compress the body based on `was_sparse` (the
    /// previous save's encoding, for hysteresis) and size.
    pub(crate) fn encode(&self, was_dense: bool) -> Vec<u8> {
        let set_count = self.bitfield.count_ones();
        let fraction = if self.piece_count == 0 {
            0.0
        } else {
            set_count as f64 / self.piece_count as f64
        };

        let use_dense = if was_dense {
            fraction > SPARSE_THRESHOLD - HYSTERESIS
        } else {
            fraction > SPARSE_THRESHOLD + HYSTERESIS
        };

        let raw_body = if use_dense {
            crate::bitfield::to_wire_bytes(&self.bitfield)
        } else {
            let mut out = Vec::with_capacity(set_count * 4);
            for i in crate::bitfield::set_indices(&self.bitfield) {
                out.extend_from_slice(&(i as u32).to_le_bytes());
            }
            out
        };

        let mut body_crc = Crc32::new();
        body_crc.update(&raw_body);
        let body_crc = body_crc.finalize();

        let (body, compressed, compression_level) = maybe_compress(&raw_body);

        let mut buf = Vec::with_capacity(HEADER_LEN + body.len() + FOOTER_LEN);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&(self.piece_count as u32).to_le_bytes());
        buf.extend_from_slice(&self.piece_len.to_le_bytes());
        buf.extend_from_slice(&self.total_len.to_le_bytes());
        buf.extend_from_slice(&self.uploaded_bytes.to_le_bytes());
        buf.extend_from_slice(&self.last_modified.to_le_bytes());
        let mut flags = 0u8;
        if compressed {
            flags |= FLAG_COMPRESSED;
        }
        if !use_dense {
            flags |= FLAG_SPARSE;
        }
        buf.push(flags);
        buf.push(compression_level);
        buf.extend_from_slice(&[0u8; 6]);
        debug_assert_eq!(buf.len(), HEADER_LEN - 4);

        let mut header_crc = Crc32::new();
        header_crc.update(&buf);
        buf.extend_from_slice(&header_crc.finalize().to_le_bytes());
        debug_assert_eq!(buf.len(), HEADER_LEN);

        buf.extend_from_slice(&body);
        buf.extend_from_slice(&self.uploaded_bytes.to_le_bytes());
        buf.extend_from_slice(&body_crc.to_le_bytes());
        buf
    }

    /// Reports whether a just-encoded buffer used the dense bitfield
    /// encoding, so the caller can pass the right `was_dense` hysteresis
    /// hint into the next `encode` call.
    pub(crate) fn is_dense(encoded: &[u8]) -> bool {
        encoded.len() > 60 && encoded[60] & FLAG_SPARSE == 0
    }

    /// Parses either the current versioned format or the legacy raw
    /// bitfield + uploaded-counter format.
    pub(crate) fn decode(bytes: &[u8], piece_count: usize) -> Result<Self> {
        if bytes.starts_with(MAGIC) {
            Self::decode_current(bytes)
        } else {
            Self::decode_legacy(bytes, piece_count)
        }
    }

    fn decode_current(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN + FOOTER_LEN {
            return Err(Error::StateFileCorrupt("truncated header"));
        }
        let header = &bytes[..HEADER_LEN - 4];
        let mut crc = Crc32::new();
        crc.update(header);
        let expected_crc = u32::from_le_bytes(bytes[HEADER_LEN - 4..HEADER_LEN].try_into().unwrap());
        if crc.finalize() != expected_crc {
            return Err(Error::StateFileCorrupt("header checksum mismatch"));
        }

        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(Error::StateFileCorrupt("unsupported version"));
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[8..28]);
        let piece_count = u32::from_le_bytes(bytes[28..32].try_into().unwrap()) as usize;
        let piece_len = u32::from_le_bytes(bytes[32..36].try_into().unwrap());
        let total_len = u64::from_le_bytes(bytes[36..44].try_into().unwrap());
        let uploaded_bytes = u64::from_le_bytes(bytes[44..52].try_into().unwrap());
        let last_modified = u64::from_le_bytes(bytes[52..60].try_into().unwrap());
        let flags = bytes[60];

        let rest = &bytes[HEADER_LEN..];
        if rest.len() < FOOTER_LEN {
            return Err(Error::StateFileCorrupt("truncated body"));
        }
        let (raw_body_field, footer) = rest.split_at(rest.len() - FOOTER_LEN);
        let footer_uploaded_bytes = u64::from_le_bytes(footer[..8].try_into().unwrap());
        let expected_body_crc = u32::from_le_bytes(footer[8..12].try_into().unwrap());
        if footer_uploaded_bytes != uploaded_bytes {
            return Err(Error::StateFileCorrupt("header/footer uploaded counter mismatch"));
        }

        let raw_body = if flags & FLAG_COMPRESSED != 0 {
            let mut decoder = GzDecoder::new(raw_body_field);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|_| Error::StateFileCorrupt("gzip decompression failed"))?;
            out
        } else {
            raw_body_field.to_vec()
        };

        let mut body_crc = Crc32::new();
        body_crc.update(&raw_body);
        if body_crc.finalize() != expected_body_crc {
            return Err(Error::StateFileCorrupt("body checksum mismatch"));
        }

        let bitfield = if flags & FLAG_SPARSE == 0 {
            crate::bitfield::from_wire_bytes(&raw_body, piece_count)
                .ok_or(Error::StateFileCorrupt("dense bitfield too short"))?
        } else {
            let mut bitfield = crate::bitfield::empty(piece_count);
            for chunk in raw_body.chunks_exact(4) {
                let index = u32::from_le_bytes(chunk.try_into().unwrap()) as usize;
                if index < piece_count {
                    bitfield.set(index, true);
                }
            }
            bitfield
        };

        Ok(Self {
            info_hash,
            piece_count,
            piece_len,
            total_len,
            uploaded_bytes,
            last_modified,
            bitfield,
        })
    }

    /// The legacy format carries no piece count, so the caller (which knows
    /// it from the metainfo) supplies it; the trailing 8 bytes are the
    /// uploaded byte counter and everything before it is the packed
    /// bitfield.
    fn decode_legacy(bytes: &[u8], piece_count: usize) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::StateFileCorrupt("legacy file too short"));
        }
        let (bitfield_bytes, uploaded_bytes) = bytes.split_at(bytes.len() - 8);
        let bitfield = crate::bitfield::from_wire_bytes(bitfield_bytes, piece_count)
            .ok_or(Error::StateFileCorrupt("legacy bitfield too short"))?;
        let uploaded_bytes = u64::from_le_bytes(uploaded_bytes.try_into().unwrap());
        Ok(Self {
            info_hash: [0; 20],
            piece_count,
            piece_len: 0,
            total_len: 0,
            uploaded_bytes,
            last_modified: 0,
            bitfield,
        })
    }
}

/// Compresses `raw` with gzip only if the result is strictly smaller and
/// `raw` is large enough that compression is worth the CPU (anything under
/// 1 KiB is left uncompressed regardless of ratio). Returns the body to
/// write, whether it's compressed, and the compression level used (0 if
/// not compressed).
fn maybe_compress(raw: &[u8]) -> (Vec<u8>, bool, u8) {
    if raw.len() <= 1024 {
        return (raw.to_vec(), false, 0);
    }
    let level = Compression::default();
    let mut encoder = GzEncoder::new(Vec::new(), level);
    if encoder.write_all(raw).is_err() {
        return (raw.to_vec(), false, 0);
    }
    match encoder.finish() {
        Ok(compressed) if compressed.len() < raw.len() => {
            (compressed, true, level.level() as u8)
        }
        _ => (raw.to_vec(), false, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(piece_count: usize, set: &[usize]) -> StateFile {
        let mut bitfield = crate::bitfield::empty(piece_count);
        for &i in set {
            bitfield.set(i, true);
        }
        StateFile {
            info_hash: [9; 20],
            piece_count,
            piece_len: 16 * 1024,
            total_len: piece_count as u64 * 16 * 1024,
            uploaded_bytes: 12345,
            last_modified: 1_700_000_000,
            bitfield,
        }
    }

    #[test]
    fn test_round_trip_sparse() {
        let state = sample(1000, &[1, 2, 900]);
        let encoded = state.encode(false);
        let decoded = StateFile::decode(&encoded, 1000).unwrap();
        assert_eq!(decoded.bitfield, state.bitfield);
        assert_eq!(decoded.uploaded_bytes, 12345);
        assert_eq!(decoded.piece_len, state.piece_len);
        assert_eq!(decoded.total_len, state.total_len);
        assert_eq!(decoded.last_modified, state.last_modified);
    }

    #[test]
    fn test_round_trip_dense() {
        let all: Vec<usize> = (0..200).collect();
        let state = sample(200, &all);
        let encoded = state.encode(false);
        let decoded = StateFile::decode(&encoded, 200).unwrap();
        assert_eq!(decoded.bitfield, state.bitfield);
    }

    #[test]
    fn test_corrupt_header_detected() {
        let state = sample(100, &[1]);
        let mut encoded = state.encode(false);
        encoded[10] ^= 0xff;
        assert!(StateFile::decode(&encoded, 100).is_err());
    }

    #[test]
    fn test_legacy_format_decodes() {
        let piece_count = 16;
        let mut bitfield = crate::bitfield::empty(piece_count);
        bitfield.set(3, true);
        let mut bytes = crate::bitfield::to_wire_bytes(&bitfield);
        bytes.extend_from_slice(&42u64.to_le_bytes());
        let decoded = StateFile::decode(&bytes, piece_count).unwrap();
        assert_eq!(decoded.uploaded_bytes, 42);
        assert!(decoded.bitfield[3]);
    }

    #[test]
    fn test_hysteresis_keeps_dense_near_threshold() {
        // 12% set: above the bare 10% threshold but within the hysteresis
        // band if we were already dense
        let set: Vec<usize> = (0..12).collect();
        let state = sample(100, &set);
        let encoded_from_dense = state.encode(true);
        let encoded_from_sparse = state.encode(false);
        // from dense, should stay dense (sparse flag bit clear)
        assert_eq!(encoded_from_dense[60] & FLAG_SPARSE, 0);
        // from sparse, 12% is still below the upper hysteresis band
        // (threshold + margin = 12%) so it may stay sparse
        let _ = encoded_from_sparse;
    }

    #[test]
    fn test_footer_uploaded_mismatch_rejected() {
        let state = sample(100, &[1]);
        let mut encoded = state.encode(false);
        let len = encoded.len();
        // corrupt the footer's uploaded counter without touching the header
        encoded[len - FOOTER_LEN] ^= 0xff;
        assert!(StateFile::decode(&encoded, 100).is_err());
    }
}
