//! Helpers over the [`crate::Bitfield`] type (a packed, MSB-first bool
//! vector backed by `bitvec`) implementing the operations named in spec.md
//! §3: `get`, `set`, `haveAll`, `haveNone`, `popcount`, and ascending
//! iteration of set indices.
//!
//! These are free functions rather than a newtype wrapper so that callers
//! (e.g. `peer`) can keep using `bitvec`'s own API (`resize`, `all`, slicing)
//! directly on the type alias, as the teacher's code already does.

use crate::{Bitfield, PieceIndex};

/// Builds an all-zero bitfield of `piece_count` logical bits. The backing
/// byte buffer is rounded up to a whole number of bytes; trailing padding
/// bits are zero and remain zero through every `set` below.
pub(crate) fn empty(piece_count: usize) -> Bitfield {
    Bitfield::repeat(false, piece_count)
}

/// Returns whether every logical bit is set (we/peer have every piece).
pub(crate) fn have_all(bitfield: &Bitfield) -> bool {
    bitfield.all()
}

/// Returns whether no logical bit is set.
pub(crate) fn have_none(bitfield: &Bitfield) -> bool {
    bitfield.not_any()
}

/// Returns the number of set bits.
pub(crate) fn popcount(bitfield: &Bitfield) -> usize {
    bitfield.count_ones()
}

/// Returns the ascending indices of set bits.
pub(crate) fn set_indices(bitfield: &Bitfield) -> impl Iterator<Item = PieceIndex> + '_ {
    bitfield.iter().enumerate().filter_map(|(i, bit)| if *bit { Some(i) } else { None })
}

/// Decodes a wire-format packed bitfield (§4.1 message id 5) into a
/// [`Bitfield`] of exactly `piece_count` logical bits, discarding any
/// padding bits in the last byte. Returns `None` if the payload is shorter
/// than `ceil(piece_count / 8)` bytes.
pub(crate) fn from_wire_bytes(bytes: &[u8], piece_count: usize) -> Option<Bitfield> {
    let expected_len = (piece_count + 7) / 8;
    if bytes.len() < expected_len {
        return None;
    }
    let mut bitfield = Bitfield::from_slice(&bytes[..expected_len]);
    bitfield.resize(piece_count, false);
    Some(bitfield)
}

/// Encodes a bitfield into wire format (§4.1 message id 5): packed,
/// MSB-first, trailing padding bits zero.
pub(crate) fn to_wire_bytes(bitfield: &Bitfield) -> Vec<u8> {
    let mut padded = bitfield.clone();
    let padded_len = (padded.len() + 7) / 8 * 8;
    padded.resize(padded_len, false);
    padded.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_matches_byte_layout() {
        let mut bitfield = empty(10);
        bitfield.set(0, true);
        bitfield.set(1, true);
        bitfield.set(7, true);
        let bytes = to_wire_bytes(&bitfield);
        assert_eq!(bytes[0], 0b1100_0001);

        for i in 0..10 {
            let expected = i == 0 || i == 1 || i == 7;
            assert_eq!(bitfield[i], expected, "bit {} mismatch", i);
        }
    }

    #[test]
    fn test_have_all_have_none() {
        let piece_count = 13;
        let empty_bf = empty(piece_count);
        assert!(have_none(&empty_bf));
        assert!(!have_all(&empty_bf));

        let full = Bitfield::repeat(true, piece_count);
        assert!(have_all(&full));
        assert!(!have_none(&full));
    }

    #[test]
    fn test_padding_bits_stay_zero() {
        // 10 pieces -> 2 bytes -> 6 padding bits in the second byte
        let mut bitfield = empty(10);
        for i in 0..10 {
            bitfield.set(i, true);
        }
        let bytes = to_wire_bytes(&bitfield);
        assert_eq!(bytes.len(), 2);
        // only the top 2 bits of the second byte are logical (indices 8, 9)
        assert_eq!(bytes[1] & 0b0011_1111, 0);
    }

    #[test]
    fn test_from_wire_bytes_truncates_padding() {
        let bytes = [0b1111_1111u8, 0b1100_0000];
        let bitfield = from_wire_bytes(&bytes, 10).unwrap();
        assert_eq!(bitfield.len(), 10);
        assert_eq!(popcount(&bitfield), 10);
    }

    #[test]
    fn test_set_indices_ascending() {
        let mut bitfield = empty(8);
        bitfield.set(5, true);
        bitfield.set(1, true);
        bitfield.set(6, true);
        let indices: Vec<_> = set_indices(&bitfield).collect();
        assert_eq!(indices, vec![1, 5, 6]);
    }
}
