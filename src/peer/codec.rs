//! The handshake and peer wire message codecs (§4.1).
//!
//! Two `tokio_util::codec` implementations are used in sequence on the same
//! socket: [`HandshakeCodec`] for the fixed 68 byte handshake, then
//! [`PeerCodec`] for the `length:u32 | id:u8 | payload` framed messages that
//! follow, exactly the way the teacher's `peer.rs` swaps codecs via
//! `FramedParts` after the handshake completes.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::{Bitfield, BlockInfo, PeerId, Sha1Hash, Sha256Hash};

/// The literal BitTorrent protocol string sent in every handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The hard cap on a single message frame (§4.1): 2 MiB.
pub(crate) const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

/// Reserved bit: extended protocol support (BEP 10), reserved byte 5, bit 0x10.
pub(crate) const RESERVED_EXTENSION_PROTOCOL: (usize, u8) = (5, 0x10);
/// Reserved bit: Fast Extension support (BEP 6), reserved byte 7, bit 0x04.
pub(crate) const RESERVED_FAST_EXTENSION: (usize, u8) = (7, 0x04);
/// Reserved bit: v2 support, reserved byte 7, bit 0x10 (non-standard but
/// matches the table in spec.md §4.1).
pub(crate) const RESERVED_V2: (usize, u8) = (7, 0x10);

fn set_reserved_bit(reserved: &mut [u8; 8], (byte, mask): (usize, u8)) {
    reserved[byte] |= mask;
}

fn has_reserved_bit(reserved: &[u8; 8], (byte, mask): (usize, u8)) -> bool {
    reserved[byte] & mask != 0
}

/// The 68 byte BitTorrent handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub(crate) fn new(
        info_hash: Sha1Hash,
        peer_id: PeerId,
        fast_extension: bool,
        v2: bool,
    ) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        set_reserved_bit(&mut reserved, RESERVED_EXTENSION_PROTOCOL);
        if fast_extension {
            set_reserved_bit(&mut reserved, RESERVED_FAST_EXTENSION);
        }
        if v2 {
            set_reserved_bit(&mut reserved, RESERVED_V2);
        }
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub(crate) fn supports_fast_extension(&self) -> bool {
        has_reserved_bit(&self.reserved, RESERVED_FAST_EXTENSION)
    }

    pub(crate) fn supports_extended_protocol(&self) -> bool {
        has_reserved_bit(&self.reserved, RESERVED_EXTENSION_PROTOCOL)
    }

    pub(crate) fn supports_v2(&self) -> bool {
        has_reserved_bit(&self.reserved, RESERVED_V2)
    }
}

pub(crate) struct HandshakeCodec;

const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, hs: Handshake, buf: &mut BytesMut) -> Result<(), Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(&hs.prot);
        buf.put_slice(&hs.reserved);
        buf.put_slice(&hs.info_hash);
        buf.put_slice(&hs.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        let prot_len = buf[0];
        if prot_len as usize != PROTOCOL_STRING.len() {
            return Err(Error::ProtocolViolation("bad protocol string length"));
        }
        let mut buf = buf.split_to(HANDSHAKE_LEN);
        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::ProtocolViolation("bad protocol string"));
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);
        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The wire message IDs (§4.1). Deliberately non-contiguous: never renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    SuggestPiece = 13,
    HaveAll = 14,
    HaveNone = 15,
    RejectRequest = 16,
    AllowedFast = 17,
    Extended = 20,
    HashRequest = 21,
    Hashes = 22,
    HashReject = 23,
}

impl MessageId {
    fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            9 => Self::Port,
            13 => Self::SuggestPiece,
            14 => Self::HaveAll,
            15 => Self::HaveNone,
            16 => Self::RejectRequest,
            17 => Self::AllowedFast,
            20 => Self::Extended,
            21 => Self::HashRequest,
            22 => Self::Hashes,
            23 => Self::HashReject,
            _ => return None,
        })
    }
}

/// A `HashRequest`/`Hashes`/`HashReject` payload prefix (BEP 52, message ids
/// 21-23 share the same leading fields).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HashRequest {
    pub pieces_root: Sha256Hash,
    pub base_layer: u8,
    pub index: u32,
    pub length: u32,
    pub proof_layers: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block { piece_index: usize, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
    Port(u16),
    SuggestPiece { piece_index: u32 },
    HaveAll,
    HaveNone,
    RejectRequest(BlockInfo),
    AllowedFast { piece_index: u32 },
    Extended { ext_id: u8, payload: Vec<u8> },
    HashRequest(HashRequest),
    Hashes { request: HashRequest, hashes: Vec<Sha256Hash> },
    HashReject(HashRequest),
}

impl Message {
    pub(crate) fn id(&self) -> Option<MessageId> {
        Some(match self {
            Self::KeepAlive => return None,
            Self::Choke => MessageId::Choke,
            Self::Unchoke => MessageId::Unchoke,
            Self::Interested => MessageId::Interested,
            Self::NotInterested => MessageId::NotInterested,
            Self::Have { .. } => MessageId::Have,
            Self::Bitfield(_) => MessageId::Bitfield,
            Self::Request(_) => MessageId::Request,
            Self::Block { .. } => MessageId::Piece,
            Self::Cancel(_) => MessageId::Cancel,
            Self::Port(_) => MessageId::Port,
            Self::SuggestPiece { .. } => MessageId::SuggestPiece,
            Self::HaveAll => MessageId::HaveAll,
            Self::HaveNone => MessageId::HaveNone,
            Self::RejectRequest(_) => MessageId::RejectRequest,
            Self::AllowedFast { .. } => MessageId::AllowedFast,
            Self::Extended { .. } => MessageId::Extended,
            Self::HashRequest(_) => MessageId::HashRequest,
            Self::Hashes { .. } => MessageId::Hashes,
            Self::HashReject(_) => MessageId::HashReject,
        })
    }
}

fn put_block_info(buf: &mut BytesMut, b: &BlockInfo) {
    buf.put_u32(b.piece_index as u32);
    buf.put_u32(b.offset);
    buf.put_u32(b.len);
}

fn put_hash_request(buf: &mut BytesMut, r: &HashRequest) {
    buf.put_slice(&r.pieces_root);
    buf.put_u8(r.base_layer);
    buf.put_u32(r.index);
    buf.put_u32(r.length);
    buf.put_u8(r.proof_layers);
}

fn get_hash_request(buf: &mut BytesMut) -> HashRequest {
    let mut pieces_root = [0; 32];
    buf.copy_to_slice(&mut pieces_root);
    let base_layer = buf.get_u8();
    let index = buf.get_u32();
    let length = buf.get_u32();
    let proof_layers = buf.get_u8();
    HashRequest {
        pieces_root,
        base_layer,
        index,
        length,
        proof_layers,
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Error> {
        // reserve the length prefix, fill it in after we know the body size
        let len_pos = buf.len();
        buf.put_u32(0);
        let body_start = buf.len();

        if let Some(id) = msg.id() {
            buf.put_u8(id as u8);
        }

        match msg {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => {}
            Message::Have { piece_index } => buf.put_u32(piece_index),
            Message::Bitfield(bitfield) => {
                buf.put_slice(&crate::bitfield::to_wire_bytes(&bitfield))
            }
            Message::Request(b) | Message::Cancel(b) | Message::RejectRequest(b) => {
                put_block_info(buf, &b)
            }
            Message::Block { piece_index, offset, data } => {
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Port(port) => buf.put_u16(port),
            Message::SuggestPiece { piece_index }
            | Message::AllowedFast { piece_index } => buf.put_u32(piece_index),
            Message::Extended { ext_id, payload } => {
                buf.put_u8(ext_id);
                buf.put_slice(&payload);
            }
            Message::HashRequest(r) | Message::HashReject(r) => put_hash_request(buf, &r),
            Message::Hashes { request, hashes } => {
                put_hash_request(buf, &request);
                for h in hashes {
                    buf.put_slice(&h);
                }
            }
        }

        let body_len = (buf.len() - body_start) as u32;
        if body_len + 1 > MAX_FRAME_LEN {
            return Err(Error::OversizedFrame(body_len + 1));
        }
        buf[len_pos..len_pos + 4].copy_from_slice(&body_len.to_be_bytes());
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if len > MAX_FRAME_LEN {
            return Err(Error::OversizedFrame(len));
        }
        if buf.len() < 4 + len as usize {
            buf.reserve(4 + len as usize - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let mut body = buf.split_to(len as usize);
        let id_byte = body.get_u8();
        let id = MessageId::from_u8(id_byte)
            .ok_or(Error::ProtocolViolation("unknown message id"))?;

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have { piece_index: body.get_u32() },
            MessageId::Bitfield => Message::Bitfield(Bitfield::from_slice(&body)),
            MessageId::Request => Message::Request(get_block_info(&mut body)),
            MessageId::Piece => {
                let piece_index = body.get_u32() as usize;
                let offset = body.get_u32();
                let data = body.to_vec();
                Message::Block { piece_index, offset, data }
            }
            MessageId::Cancel => Message::Cancel(get_block_info(&mut body)),
            MessageId::Port => Message::Port(body.get_u16()),
            MessageId::SuggestPiece => {
                Message::SuggestPiece { piece_index: body.get_u32() }
            }
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::RejectRequest => Message::RejectRequest(get_block_info(&mut body)),
            MessageId::AllowedFast => {
                Message::AllowedFast { piece_index: body.get_u32() }
            }
            MessageId::Extended => {
                let ext_id = body.get_u8();
                let payload = body.to_vec();
                Message::Extended { ext_id, payload }
            }
            MessageId::HashRequest => Message::HashRequest(get_hash_request(&mut body)),
            MessageId::Hashes => {
                let request = get_hash_request(&mut body);
                let mut hashes = Vec::new();
                while body.remaining() >= 32 {
                    let mut h = [0; 32];
                    body.copy_to_slice(&mut h);
                    hashes.push(h);
                }
                Message::Hashes { request, hashes }
            }
            MessageId::HashReject => Message::HashReject(get_hash_request(&mut body)),
        };
        Ok(Some(msg))
    }
}

fn get_block_info(buf: &mut BytesMut) -> BlockInfo {
    let piece_index = buf.get_u32() as usize;
    let offset = buf.get_u32();
    let len = buf.get_u32();
    BlockInfo { piece_index, offset, len }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let mut codec = HandshakeCodec;
        let hs = Handshake::new([7; 20], [9; 20], true, true);
        let mut buf = BytesMut::new();
        codec.encode(hs.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, hs);
        assert!(decoded.supports_fast_extension());
        assert!(decoded.supports_v2());
        assert!(decoded.supports_extended_protocol());
    }

    #[test]
    fn test_handshake_rejects_bad_protocol_string() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"not the right proto");
        buf.put_slice(&[0; 8]);
        buf.put_slice(&[0; 20]);
        buf.put_slice(&[0; 20]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_keep_alive_round_trip() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::KeepAlive);
    }

    #[test]
    fn test_request_round_trip() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        let req = BlockInfo { piece_index: 3, offset: 16384, len: 16384 };
        codec.encode(Message::Request(req), &mut buf).unwrap();
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Request(req));
    }

    #[test]
    fn test_have_all_have_none() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::HaveAll, &mut buf).unwrap();
        codec.encode(Message::HaveNone, &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::HaveAll);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::HaveNone);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_bitfield_round_trip_preserves_bits() {
        let mut codec = PeerCodec;
        let mut bitfield = crate::Bitfield::repeat(false, 10);
        bitfield.set(0, true);
        bitfield.set(9, true);
        let mut buf = BytesMut::new();
        codec.encode(Message::Bitfield(bitfield.clone()), &mut buf).unwrap();
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg {
            Message::Bitfield(decoded) => {
                // wire form may carry trailing padding bits; compare the
                // logical prefix
                assert_eq!(&decoded[..10], &bitfield[..10]);
            }
            _ => panic!("expected bitfield"),
        }
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Choke as u8);
        // missing remaining 4 bytes of a 5 byte body
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
