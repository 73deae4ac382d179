//! Piece hash verification: v1 whole-piece SHA-1, and v2 per-piece Merkle
//! root over 16 KiB leaf hashes (BEP 52).

use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha256Digest, Sha256};

use crate::{Sha1Hash, Sha256Hash, BLOCK_LEN};

pub(super) fn verify_v1(data: &[u8], expected: &Sha1Hash) -> bool {
    let digest = Sha1::digest(data);
    digest.as_slice() == expected
}

/// Computes a v2 piece's Merkle root from its 16 KiB leaf blocks and
/// compares it against `expected_root` (the piece's `pieces root` entry, or
/// the relevant leaf of the torrent's piece layer for multi-piece files).
///
/// Leaves are SHA-256 hashes of each 16 KiB block (the final block is
/// zero-padded up to 16 KiB before hashing, per BEP 52), and the leaf list
/// is padded with the BEP 52 zero-hash sentinel up to the next power of two
/// before the pairwise reduction.
pub(super) fn verify_v2_leaf(data: &[u8], expected_root: &Sha256Hash) -> bool {
    merkle_root(data) == *expected_root
}

pub(crate) fn merkle_root(data: &[u8]) -> Sha256Hash {
    let mut leaves: Vec<Sha256Hash> = data
        .chunks(BLOCK_LEN as usize)
        .map(|chunk| {
            if chunk.len() == BLOCK_LEN as usize {
                hash_block(chunk)
            } else {
                let mut padded = vec![0u8; BLOCK_LEN as usize];
                padded[..chunk.len()].copy_from_slice(chunk);
                hash_block(&padded)
            }
        })
        .collect();

    if leaves.is_empty() {
        leaves.push(ZERO_HASH);
    }

    let padded_len = leaves.len().next_power_of_two();
    leaves.resize(padded_len, ZERO_HASH);

    while leaves.len() > 1 {
        leaves = leaves
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    leaves[0]
}

/// The BEP 52 padding value: 32 zero bytes, used to pad the leaf layer to a
/// power of two before the pairwise reduction.
const ZERO_HASH: Sha256Hash = [0u8; 32];

fn hash_block(block: &[u8]) -> Sha256Hash {
    let digest = Sha256::digest(block);
    let mut out = [0; 32];
    out.copy_from_slice(&digest);
    out
}

fn hash_pair(a: &Sha256Hash, b: &Sha256Hash) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    let digest = hasher.finalize();
    let mut out = [0; 32];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_verify_matches_sha1() {
        let data = b"hello world";
        let digest = Sha1::digest(data);
        let mut expected = [0; 20];
        expected.copy_from_slice(&digest);
        assert!(verify_v1(data, &expected));
        assert!(!verify_v1(b"goodbye", &expected));
    }

    #[test]
    fn test_merkle_root_single_block_equals_its_hash() {
        let data = vec![7u8; BLOCK_LEN as usize];
        let root = merkle_root(&data);
        assert_eq!(root, hash_block(&data));
    }

    #[test]
    fn test_merkle_root_is_deterministic_and_order_sensitive() {
        let mut data = vec![1u8; BLOCK_LEN as usize * 2];
        data[BLOCK_LEN as usize] = 2;
        let a = merkle_root(&data);
        let b = merkle_root(&data);
        assert_eq!(a, b);

        let mut reordered = data.clone();
        reordered.swap(0, BLOCK_LEN as usize);
        assert_ne!(merkle_root(&reordered), a);
    }
}
