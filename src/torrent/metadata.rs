//! Downloads a torrent's `info` dictionary from a set of peers over the
//! BEP 9 `ut_metadata` extension, so a magnet link can be turned into a full
//! [`Metainfo`] before a torrent's storage and piece hashes can be derived.
//!
//! Pieces are requested round-robin, pipelined across every peer that
//! completed the extension handshake, per §4.5: this runs its own
//! short-lived connections rather than reusing [`crate::peer::PeerSession`],
//! which has no outbound path for `Message::Extended` and drops incoming
//! ones unconditionally.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::{future::join_all, SinkExt, StreamExt};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha256Digest, Sha256};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedParts};

use crate::error::{Error, Result};
use crate::events::Event;
use crate::magnet::{MagnetInfoHash, MagnetLink};
use crate::metainfo::Metainfo;
use crate::peer::{Handshake, HandshakeCodec, Message, PeerCodec};
use crate::{InfoHash, PeerId, TorrentId};

/// The extension id we advertise for `ut_metadata` in our own handshake.
const UT_METADATA_ID: u8 = 1;
/// The size of a metadata piece (all but the last), per BEP 9.
const METADATA_PIECE_LEN: usize = 16 * 1024;
/// Hard cap on an advertised `metadata_size`, so a lying peer can't make us
/// allocate an unbounded buffer.
const MAX_METADATA_SIZE: usize = 64 * 1024 * 1024;
/// How many candidate peers we attempt to use at once.
const MAX_CONCURRENT_PEERS: usize = 8;
/// Outstanding piece requests we allow per peer at a time.
const PER_PEER_PIPELINE_CAP: usize = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Serialize, Deserialize)]
struct ExtensionHandshake {
    m: BTreeMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata_size: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataMessage {
    msg_type: i64,
    piece: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,
}

const MSG_TYPE_REQUEST: i64 = 0;
const MSG_TYPE_DATA: i64 = 1;
const MSG_TYPE_REJECT: i64 = 2;

type PeerSocket = Framed<TcpStream, PeerCodec>;
type ReadFuture = std::pin::Pin<
    Box<dyn std::future::Future<Output = (usize, PeerSocket, Result<Option<Message>>)>>,
>;

/// A peer that made it past the extension handshake and is participating in
/// the round-robin piece fetch.
struct Peer {
    /// The extension id *we* must tag outgoing messages to this peer with
    /// (the id it advertised for `ut_metadata` in its own handshake).
    ut_metadata_id: u8,
    outstanding: usize,
}

/// Drives the BEP 9 metadata exchange against a set of candidate peer
/// addresses (from a magnet link's `x.pe` hints, or any peers otherwise
/// known before the torrent's metainfo is available).
pub(crate) struct MetadataDownloader;

impl MetadataDownloader {
    /// Connects to (a bounded subset of) the candidate addresses, and
    /// fetches and verifies the info dictionary by round-robining piece
    /// requests across however many of them complete the extension
    /// handshake.
    pub(crate) async fn fetch(
        id: TorrentId,
        magnet: &MagnetLink,
        client_id: PeerId,
        candidates: &[SocketAddr],
        events: &mpsc::UnboundedSender<Event>,
    ) -> Result<Metainfo> {
        let info_hash: InfoHash = magnet.info_hash.into();

        let greetings = join_all(
            candidates
                .iter()
                .take(MAX_CONCURRENT_PEERS)
                .map(|&addr| greet(addr, info_hash, client_id)),
        )
        .await;

        let mut sockets = Vec::new();
        let mut peers = Vec::new();
        let mut sizes: HashMap<usize, usize> = HashMap::new();
        for greeting in greetings {
            match greeting {
                Ok((socket, ut_metadata_id, metadata_size)) => {
                    sockets.push(socket);
                    peers.push(Peer { ut_metadata_id, outstanding: 0 });
                    *sizes.entry(metadata_size).or_insert(0) += 1;
                }
                Err(e) => log::debug!("Metadata peer handshake failed: {}", e),
            }
        }

        if sockets.is_empty() {
            return Err(Error::ProtocolViolation("no usable metadata peers"));
        }

        // trust whichever `metadata_size` the most peers agree on
        let size = *sizes
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(size, _)| size)
            .expect("at least one peer connected");
        if size == 0 || size > MAX_METADATA_SIZE {
            return Err(Error::ProtocolViolation("implausible metadata_size"));
        }

        let piece_count = (size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN;
        let mut buf = vec![0u8; size];
        let mut received = vec![false; piece_count];
        let mut pending: VecDeque<usize> = (0..piece_count).collect();
        let mut assigned: HashMap<usize, usize> = HashMap::new();

        let mut reads: FuturesUnordered<ReadFuture> = FuturesUnordered::new();
        for (idx, socket) in sockets.into_iter().enumerate() {
            top_up(idx, &mut peers[idx], &mut pending, &mut assigned, socket, &mut reads).await?;
        }

        let mut done = 0usize;
        while let Some((idx, socket, result)) = reads.next().await {
            let socket = match result {
                Ok(Some(msg)) => {
                    handle_message(idx, msg, &mut peers, &mut buf, &mut received, &mut pending, &mut assigned)?;

                    let new_done = received.iter().filter(|&&r| r).count();
                    if new_done != done {
                        done = new_done;
                        let _ = events.send(Event::MetaDataDownloadProgress(
                            id,
                            done as f64 / piece_count as f64,
                        ));
                    }
                    if done == piece_count {
                        return finish(id, magnet, buf, events);
                    }
                    Some(socket)
                }
                Ok(None) | Err(_) => {
                    requeue_peer(idx, &mut assigned, &mut pending);
                    None
                }
            };

            if let Some(socket) = socket {
                top_up(idx, &mut peers[idx], &mut pending, &mut assigned, socket, &mut reads)
                    .await?;
            }

            if reads.is_empty() && done < piece_count {
                return Err(Error::ProtocolViolation(
                    "all metadata peers disconnected before completion",
                ));
            }
        }

        Err(Error::ProtocolViolation("metadata exchange ended without completing"))
    }
}

/// Connects to `addr`, performs the BitTorrent handshake, then the BEP 10
/// extension handshake, and returns the peer's advertised `ut_metadata`
/// extension id and `metadata_size`.
async fn greet(
    addr: SocketAddr,
    info_hash: InfoHash,
    client_id: PeerId,
) -> Result<(PeerSocket, u8, usize)> {
    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::ProtocolViolation("connect timed out"))??;
    let mut socket = Framed::new(tcp, HandshakeCodec);

    let handshake = Handshake::new(
        info_hash.handshake_hash(),
        client_id,
        true,
        info_hash.supports_v2(),
    );
    socket.send(handshake.clone()).await?;

    let peer_handshake = timeout(MESSAGE_TIMEOUT, socket.next())
        .await
        .map_err(|_| Error::ProtocolViolation("handshake timed out"))?
        .ok_or(Error::ProtocolViolation("connection closed during handshake"))??;
    if peer_handshake.info_hash != handshake.info_hash {
        return Err(Error::InvalidPeerInfoHash);
    }
    if !peer_handshake.supports_extended_protocol() {
        return Err(Error::ProtocolViolation(
            "peer doesn't support the extension protocol",
        ));
    }

    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut socket = Framed::from_parts(new_parts);

    let mut m = BTreeMap::new();
    m.insert("ut_metadata".to_string(), UT_METADATA_ID as i64);
    let our_handshake = ExtensionHandshake { m, metadata_size: None };
    socket
        .send(Message::Extended { ext_id: 0, payload: serde_bencode::to_bytes(&our_handshake)? })
        .await?;

    loop {
        let msg = timeout(MESSAGE_TIMEOUT, socket.next())
            .await
            .map_err(|_| Error::ProtocolViolation("extension handshake timed out"))?
            .ok_or(Error::ProtocolViolation("connection closed during extension handshake"))??;
        if let Message::Extended { ext_id: 0, payload } = msg {
            let handshake: ExtensionHandshake = serde_bencode::from_bytes(&payload)?;
            let their_id = *handshake
                .m
                .get("ut_metadata")
                .ok_or(Error::ProtocolViolation("peer doesn't support ut_metadata"))?;
            let size = handshake
                .metadata_size
                .ok_or(Error::ProtocolViolation("peer didn't advertise metadata_size"))?;
            if size <= 0 {
                return Err(Error::ProtocolViolation("implausible metadata_size"));
            }
            return Ok((socket, their_id as u8, size as usize));
        }
        // ignore any other message (bitfield, choke, ...) while waiting
    }
}

/// Sends enough piece requests to bring `peer`'s pipeline up to
/// [`PER_PEER_PIPELINE_CAP`], then schedules the next read for it.
async fn top_up(
    idx: usize,
    peer: &mut Peer,
    pending: &mut VecDeque<usize>,
    assigned: &mut HashMap<usize, usize>,
    mut socket: PeerSocket,
    reads: &mut FuturesUnordered<ReadFuture>,
) -> Result<()> {
    while peer.outstanding < PER_PEER_PIPELINE_CAP {
        let piece = match pending.pop_front() {
            Some(p) => p,
            None => break,
        };
        let request =
            MetadataMessage { msg_type: MSG_TYPE_REQUEST, piece: piece as i64, total_size: None };
        socket
            .send(Message::Extended {
                ext_id: peer.ut_metadata_id,
                payload: serde_bencode::to_bytes(&request)?,
            })
            .await?;
        assigned.insert(piece, idx);
        peer.outstanding += 1;
    }
    reads.push(Box::pin(read_one(idx, socket)));
    Ok(())
}

async fn read_one(idx: usize, mut socket: PeerSocket) -> (usize, PeerSocket, Result<Option<Message>>) {
    let result = match timeout(MESSAGE_TIMEOUT, socket.next()).await {
        Ok(Some(Ok(msg))) => Ok(Some(msg)),
        Ok(Some(Err(e))) => Err(e),
        Ok(None) => Ok(None),
        Err(_) => Err(Error::ProtocolViolation("metadata read timed out")),
    };
    (idx, socket, result)
}

/// Requeues whatever pieces were outstanding on a peer that just died.
fn requeue_peer(idx: usize, assigned: &mut HashMap<usize, usize>, pending: &mut VecDeque<usize>) {
    let stuck: Vec<usize> =
        assigned.iter().filter(|(_, &owner)| owner == idx).map(|(&piece, _)| piece).collect();
    for piece in stuck {
        assigned.remove(&piece);
        pending.push_back(piece);
    }
}

/// Handles one message from peer `idx`: accumulates `ut_metadata` piece
/// data, requeues rejected pieces, and ignores anything else.
fn handle_message(
    idx: usize,
    msg: Message,
    peers: &mut [Peer],
    buf: &mut [u8],
    received: &mut [bool],
    pending: &mut VecDeque<usize>,
    assigned: &mut HashMap<usize, usize>,
) -> Result<()> {
    let (ext_id, payload) = match msg {
        Message::Extended { ext_id, payload } => (ext_id, payload),
        _ => return Ok(()),
    };
    if ext_id != UT_METADATA_ID {
        return Ok(());
    }

    let (dict, rest) = split_bencode_dict(&payload)?;
    let msg: MetadataMessage = serde_bencode::from_bytes(dict)?;
    let piece = msg.piece as usize;

    match msg.msg_type {
        MSG_TYPE_DATA => {
            if piece >= received.len() || received[piece] {
                return Ok(());
            }
            let offset = piece * METADATA_PIECE_LEN;
            let end = (offset + rest.len()).min(buf.len());
            if offset >= end {
                return Ok(());
            }
            buf[offset..end].copy_from_slice(&rest[..end - offset]);
            received[piece] = true;
            assigned.remove(&piece);
            peers[idx].outstanding = peers[idx].outstanding.saturating_sub(1);
            Ok(())
        }
        MSG_TYPE_REJECT => {
            assigned.remove(&piece);
            peers[idx].outstanding = peers[idx].outstanding.saturating_sub(1);
            pending.push_back(piece);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn finish(
    id: TorrentId,
    magnet: &MagnetLink,
    buf: Vec<u8>,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<Metainfo> {
    let metainfo = verify_and_parse(magnet, &buf)?;
    let _ = events.send(Event::MetaDataDownloadComplete(id, buf));
    Ok(metainfo)
}

/// Splits a buffer into its leading bencode dictionary and whatever raw
/// bytes follow it (the piece data appended after a `ut_metadata` `data`
/// message's dict, per BEP 9).
fn split_bencode_dict(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    let end = bencode_value_end(buf, 0)?;
    Ok((&buf[..end], &buf[end..]))
}

/// Returns the index one past the end of the bencode value starting at
/// `start`. Supports the subset of bencode (`i..e`, `l..e`, `d..e`, and
/// length-prefixed byte strings) needed to demux a `ut_metadata` payload.
fn bencode_value_end(buf: &[u8], start: usize) -> Result<usize> {
    match buf.get(start) {
        Some(b'i') => {
            let e = find_byte(buf, start + 1, b'e')?;
            Ok(e + 1)
        }
        Some(b'd') | Some(b'l') => {
            let is_dict = buf[start] == b'd';
            let mut pos = start + 1;
            loop {
                if buf.get(pos) == Some(&b'e') {
                    return Ok(pos + 1);
                }
                if is_dict {
                    pos = bencode_value_end(buf, pos)?; // key
                }
                pos = bencode_value_end(buf, pos)?; // value (or list item)
            }
        }
        Some(c) if c.is_ascii_digit() => {
            let colon = find_byte(buf, start, b':')?;
            let len: usize = std::str::from_utf8(&buf[start..colon])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(Error::ProtocolViolation("invalid bencode string length"))?;
            let data_start = colon + 1;
            let data_end = data_start
                .checked_add(len)
                .ok_or(Error::ProtocolViolation("bencode string length overflow"))?;
            if data_end > buf.len() {
                return Err(Error::ProtocolViolation("truncated bencode string"));
            }
            Ok(data_end)
        }
        _ => Err(Error::ProtocolViolation("invalid bencode value")),
    }
}

fn find_byte(buf: &[u8], from: usize, needle: u8) -> Result<usize> {
    buf[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| from + i)
        .ok_or(Error::ProtocolViolation("malformed bencode"))
}

/// Verifies the assembled info dict against the magnet's info hash(es) and
/// wraps it back into a minimal parseable metainfo buffer (just `info`, no
/// announce/comment/etc, all of which are optional in [`Metainfo`]).
fn verify_and_parse(magnet: &MagnetLink, info_bytes: &[u8]) -> Result<Metainfo> {
    match magnet.info_hash {
        MagnetInfoHash::V1(want) => verify_sha1(info_bytes, &want)?,
        MagnetInfoHash::V2(want) => verify_sha256(info_bytes, &want)?,
        MagnetInfoHash::Hybrid(want1, want2) => {
            verify_sha1(info_bytes, &want1)?;
            verify_sha256(info_bytes, &want2)?;
        }
    }

    let mut full = Vec::with_capacity(info_bytes.len() + 9);
    full.extend_from_slice(b"d4:info");
    full.extend_from_slice(info_bytes);
    full.push(b'e');
    Ok(Metainfo::from_bytes(&full)?)
}

fn verify_sha1(data: &[u8], want: &crate::Sha1Hash) -> Result<()> {
    let got = Sha1::digest(data);
    if got.as_slice() == want {
        Ok(())
    } else {
        Err(Error::InfoHashMismatch)
    }
}

fn verify_sha256(data: &[u8], want: &crate::Sha256Hash) -> Result<()> {
    let got = Sha256::digest(data);
    if got.as_slice() == want {
        Ok(())
    } else {
        Err(Error::InfoHashMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_bencode_dict_with_trailing_bytes() {
        let mut payload = b"d8:msg_typei1e5:piecei0ee".to_vec();
        payload.extend_from_slice(b"raw piece bytes");
        let (dict, rest) = split_bencode_dict(&payload).unwrap();
        assert_eq!(dict, b"d8:msg_typei1e5:piecei0ee");
        assert_eq!(rest, b"raw piece bytes");
    }

    #[test]
    fn test_split_bencode_dict_no_trailing_bytes() {
        let payload = b"d8:msg_typei0e5:piecei2ee".to_vec();
        let (dict, rest) = split_bencode_dict(&payload).unwrap();
        assert_eq!(dict.len(), payload.len());
        assert!(rest.is_empty());
    }

    #[test]
    fn test_verify_and_parse_rejects_mismatched_hash() {
        let magnet = MagnetLink::parse(
            "magnet:?xt=urn:btih:0000000000000000000000000000000000000000",
        )
        .unwrap();
        let info = b"d6:lengthi4e4:name4:file12:piece lengthi4e6:pieces20:\
            \x01\x02\x03\x04\x05\x06\x07\x08\x09\x10\x11\x12\x13\x14\x15\x16\x17\x18\x19\x20e";
        assert!(verify_and_parse(&magnet, info).is_err());
    }
}
