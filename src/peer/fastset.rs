//! Deterministic generation of a peer's allowed-fast set (BEP 6 / spec.md
//! §4.1): given the peer's IP (masked to its /24) and our info hash, derive
//! up to `count` piece indices a choked peer is still allowed to request.

use sha1::{Digest, Sha1};
use std::net::IpAddr;

use crate::{PieceIndex, Sha1Hash};

/// Masks an IPv4 address to its /24, leaving IPv6 untouched (the reference
/// algorithm is only defined for IPv4; for IPv6 peers we hash the address
/// as-is).
fn masked_ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            vec![octets[0], octets[1], octets[2], 0]
        }
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Computes the allowed-fast set for a peer, per the reference algorithm:
/// seed a SHA-1 chain with `masked_ip || info_hash`, re-hash repeatedly, and
/// from each 20-byte digest extract five 4-byte big-endian words, each
/// reduced mod `piece_count`, deduplicating until `count` distinct indices
/// are collected or `piece_count` is exhausted.
pub(crate) fn generate(
    ip: IpAddr,
    info_hash: &Sha1Hash,
    piece_count: usize,
    count: usize,
) -> Vec<PieceIndex> {
    if piece_count == 0 {
        return Vec::new();
    }
    let count = count.min(piece_count);
    let mut seed = Vec::with_capacity(24);
    seed.extend_from_slice(&masked_ip_bytes(ip));
    seed.extend_from_slice(info_hash);

    let mut indices = Vec::with_capacity(count);
    let mut digest: Sha1Hash = {
        let mut hasher = Sha1::new();
        hasher.update(&seed);
        let out = hasher.finalize();
        let mut buf = [0; 20];
        buf.copy_from_slice(&out);
        buf
    };

    'outer: loop {
        for chunk in digest.chunks_exact(4) {
            let word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let index = (word as usize) % piece_count;
            if !indices.contains(&index) {
                indices.push(index);
                if indices.len() == count {
                    break 'outer;
                }
            }
        }
        if indices.len() >= piece_count {
            break;
        }
        let mut hasher = Sha1::new();
        hasher.update(&digest);
        let out = hasher.finalize();
        digest.copy_from_slice(&out);
    }

    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_deterministic() {
        let ip: IpAddr = "80.4.4.200".parse().unwrap();
        let info_hash = [0x3a; 20];
        let a = generate(ip, &info_hash, 1313, 7);
        let b = generate(ip, &info_hash, 1313, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 7);
    }

    #[test]
    fn test_generate_deduplicates_and_respects_piece_count() {
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        let info_hash = [0x11; 20];
        let indices = generate(ip, &info_hash, 3, 10);
        // can never produce more distinct indices than pieces exist
        assert!(indices.len() <= 3);
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), indices.len());
        assert!(indices.iter().all(|&i| i < 3));
    }

    #[test]
    fn test_different_ips_give_different_sets() {
        let info_hash = [0x22; 20];
        let a = generate("1.2.3.4".parse().unwrap(), &info_hash, 2000, 10);
        let b = generate("5.6.7.8".parse().unwrap(), &info_hash, 2000, 10);
        assert_ne!(a, b);
    }
}
