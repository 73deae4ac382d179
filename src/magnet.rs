//! Parsing of `magnet:?` URIs (BEP 9 §2, BEP 53), the entry point for
//! starting a torrent without a `.torrent` file on disk.

use std::convert::TryFrom;
use std::net::SocketAddr;

use url::Url;

use crate::error::{Error, Result};
use crate::InfoHash;

/// A parsed magnet link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MagnetLink {
    /// `xt` — the torrent's info hash, v1, v2, or both if the link carries
    /// both an `urn:btih:` and an `urn:btmh:` parameter.
    pub info_hash: MagnetInfoHash,
    /// `dn` — display name, purely advisory.
    pub display_name: Option<String>,
    /// `tr` — one or more tracker URLs.
    pub trackers: Vec<String>,
    /// `xl` — the exact total length, if advertised.
    pub exact_length: Option<u64>,
    /// `ws` — web seed URLs.
    pub web_seeds: Vec<String>,
    /// `as` — acceptable source, a direct download URL fallback.
    pub acceptable_source: Option<String>,
    /// `x.pe` — peer hints, compact `ip:port` addresses.
    pub peer_hints: Vec<SocketAddr>,
    /// `so` — selected file indices, expanded from comma/range notation.
    pub selected_files: Option<Vec<usize>>,
}

/// The info hash(es) carried by a magnet link; unlike [`InfoHash`] this
/// allows v1-only, v2-only, or hybrid (both present).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MagnetInfoHash {
    V1(crate::Sha1Hash),
    V2(crate::Sha256Hash),
    Hybrid(crate::Sha1Hash, crate::Sha256Hash),
}

impl From<MagnetInfoHash> for InfoHash {
    fn from(m: MagnetInfoHash) -> Self {
        match m {
            MagnetInfoHash::V1(h) => InfoHash::V1(h),
            MagnetInfoHash::V2(h) => InfoHash::V2(h),
            MagnetInfoHash::Hybrid(a, b) => InfoHash::Hybrid(a, b),
        }
    }
}

impl MagnetLink {
    /// Parses a `magnet:?...` URI string.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| Error::MagnetParseFailed(e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(Error::MagnetParseFailed(
                "not a magnet: URI".to_string(),
            ));
        }

        let mut v1 = None;
        let mut v2 = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut exact_length = None;
        let mut web_seeds = Vec::new();
        let mut acceptable_source = None;
        let mut peer_hints = Vec::new();
        let mut selected_files = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => parse_xt(&value, &mut v1, &mut v2)?,
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                "xl" => {
                    exact_length = Some(value.parse::<u64>().map_err(|_| {
                        Error::MagnetParseFailed("invalid xl".to_string())
                    })?)
                }
                "ws" => web_seeds.push(value.into_owned()),
                "as" => acceptable_source = Some(value.into_owned()),
                "x.pe" => {
                    if let Ok(addr) = value.parse::<SocketAddr>() {
                        peer_hints.push(addr);
                    }
                }
                "so" => selected_files = Some(parse_selected_files(&value)?),
                _ => {}
            }
        }

        let info_hash = match (v1, v2) {
            (Some(v1), Some(v2)) => MagnetInfoHash::Hybrid(v1, v2),
            (Some(v1), None) => MagnetInfoHash::V1(v1),
            (None, Some(v2)) => MagnetInfoHash::V2(v2),
            (None, None) => {
                return Err(Error::MagnetParseFailed(
                    "missing required xt parameter".to_string(),
                ))
            }
        };

        Ok(Self {
            info_hash,
            display_name,
            trackers,
            exact_length,
            web_seeds,
            acceptable_source,
            peer_hints,
            selected_files,
        })
    }
}

/// Parses a single `xt` value, which is either `urn:btih:<hash>` (v1, 40-hex
/// or 32-base32) or `urn:btmh:<multihash>` (v2).
fn parse_xt(
    value: &str,
    v1: &mut Option<crate::Sha1Hash>,
    v2: &mut Option<crate::Sha256Hash>,
) -> Result<()> {
    if let Some(hex_or_b32) = value.strip_prefix("urn:btih:") {
        *v1 = Some(decode_btih(hex_or_b32)?);
    } else if let Some(multihash) = value.strip_prefix("urn:btmh:") {
        *v2 = Some(decode_btmh(multihash)?);
    } else {
        return Err(Error::MagnetParseFailed(format!(
            "unsupported xt namespace: {}",
            value
        )));
    }
    Ok(())
}

/// Decodes a v1 info hash, either 40 hex chars or 32 base32 chars.
fn decode_btih(s: &str) -> Result<crate::Sha1Hash> {
    let bytes = if s.len() == 40 {
        hex::decode(s)
            .map_err(|_| Error::MagnetParseFailed("bad hex btih".to_string()))?
    } else if s.len() == 32 {
        base32_decode(s)
            .ok_or_else(|| Error::MagnetParseFailed("bad base32 btih".to_string()))?
    } else {
        return Err(Error::MagnetParseFailed(format!(
            "btih must be 40 hex or 32 base32 chars, got {}",
            s.len()
        )));
    };
    crate::Sha1Hash::try_from(bytes.as_slice())
        .map_err(|_| Error::MagnetParseFailed("btih wrong length".to_string()))
}

/// Decodes a v2 `urn:btmh:` multihash. The BEP 52 multihash is the SHA-256
/// multihash prefix (`0x12 0x20`) followed by the 32 byte digest, hex
/// encoded.
fn decode_btmh(s: &str) -> Result<crate::Sha256Hash> {
    let bytes = hex::decode(s)
        .map_err(|_| Error::MagnetParseFailed("bad hex btmh".to_string()))?;
    // strip the multihash function-code/length prefix (sha-256 = 0x12, 0x20)
    let digest = if bytes.len() == 34 && bytes[0] == 0x12 && bytes[1] == 0x20 {
        &bytes[2..]
    } else if bytes.len() == 32 {
        &bytes[..]
    } else {
        return Err(Error::MagnetParseFailed(
            "btmh wrong length".to_string(),
        ));
    };
    crate::Sha256Hash::try_from(digest)
        .map_err(|_| Error::MagnetParseFailed("btmh wrong length".to_string()))
}

/// Parses the `so` parameter: comma-separated indices and `a-b` ranges.
fn parse_selected_files(value: &str) -> Result<Vec<usize>> {
    let mut out = Vec::new();
    for part in value.split(',') {
        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start
                .parse()
                .map_err(|_| Error::MagnetParseFailed("bad so range".to_string()))?;
            let end: usize = end
                .parse()
                .map_err(|_| Error::MagnetParseFailed("bad so range".to_string()))?;
            out.extend(start..=end);
        } else {
            out.push(
                part.parse()
                    .map_err(|_| Error::MagnetParseFailed("bad so index".to_string()))?,
            );
        }
    }
    Ok(out)
}

/// Minimal RFC 4648 base32 decoder (no padding), sufficient for the 32 char
/// base32 BTIH encoding used by some magnet links.
fn base32_decode(s: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u64 = 0;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    for c in s.to_ascii_uppercase().bytes() {
        let val = ALPHABET.iter().position(|&b| b == c)? as u64;
        bits = (bits << 5) | val;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v1_hex_magnet() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Some+File&tr=http%3A%2F%2Ftracker.example%2Fannounce";
        let link = MagnetLink::parse(uri).unwrap();
        match link.info_hash {
            MagnetInfoHash::V1(hash) => {
                assert_eq!(hex::encode(hash), "0123456789abcdef0123456789abcdef01234567");
            }
            _ => panic!("expected v1 info hash"),
        }
        assert_eq!(link.display_name.as_deref(), Some("Some File"));
        assert_eq!(link.trackers, vec!["http://tracker.example/announce"]);
    }

    #[test]
    fn test_parse_missing_xt_fails() {
        let uri = "magnet:?dn=NoHash";
        assert!(MagnetLink::parse(uri).is_err());
    }

    #[test]
    fn test_parse_selected_files_ranges() {
        assert_eq!(parse_selected_files("0,2-4,7").unwrap(), vec![0, 2, 3, 4, 7]);
    }

    #[test]
    fn test_parse_hybrid_magnet() {
        let btih = "0123456789abcdef0123456789abcdef01234567";
        let btmh = format!("1220{}", "ab".repeat(32));
        let uri = format!(
            "magnet:?xt=urn:btih:{}&xt=urn:btmh:{}",
            btih, btmh
        );
        let link = MagnetLink::parse(&uri).unwrap();
        assert!(matches!(link.info_hash, MagnetInfoHash::Hybrid(_, _)));
    }
}
