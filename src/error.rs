//! The crate-wide error type and taxonomy.
//!
//! Errors are grouped the way spec.md's error handling design separates
//! them: protocol errors are fatal to a single peer session, transport
//! errors are retried by the swarm, storage and state-file errors revert
//! the affected piece or state, and metadata/user errors are fatal to the
//! whole task.

use std::fmt;
use std::io;

use crate::PieceIndex;

/// The crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    // --- protocol errors (fatal to a single peer session) ---
    /// The peer's handshake info hash didn't match ours.
    InvalidPeerInfoHash,
    /// A message was received at a time the protocol doesn't allow it.
    ProtocolViolation(&'static str),
    /// A bitfield (or HaveAll/HaveNone) was sent outside of the
    /// availability-exchange window.
    BitfieldNotAfterHandshake,
    /// A frame length exceeded the hard cap (2 MiB).
    OversizedFrame(u32),
    /// A second handshake was received on an already-handshaken connection.
    DuplicateHandshake,
    /// A `Piece` message arrived with no matching outstanding request.
    UnsolicitedPiece,
    /// A peer we're not downloading from (not a seed, in the legacy
    /// seed-only mode) sent something other than a seed bitfield.
    PeerNotSeed,
    /// A peer repeatedly sent blocks failing hash verification.
    BadData,

    // --- storage errors ---
    /// A piece index outside of `0..piece_count`.
    InvalidPieceIndex,
    /// A torrent id unknown to the disk actor.
    InvalidTorrentId,
    /// A sub-piece write to one or more files failed.
    SubPieceWriteFailed,
    /// Too many consecutive storage failures; torrent paused.
    StorageStalled,

    // --- state-file errors ---
    /// Header or footer CRC did not validate, or declared sizes were
    /// inconsistent with metadata.
    StateFileCorrupt(&'static str),

    // --- metadata acquisition errors ---
    /// The magnet URI was malformed or missing a required parameter.
    MagnetParseFailed(String),
    /// The downloaded info dict's hash didn't match the magnet's `xt`.
    InfoHashMismatch,

    // --- user errors ---
    /// Bad configuration or invalid file path supplied at construction.
    InvalidConfig(&'static str),

    // --- wrapped foreign errors ---
    Io(io::Error),
    Bencode(serde_bencode::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPeerInfoHash => {
                write!(f, "peer handshake info hash mismatch")
            }
            Self::ProtocolViolation(why) => write!(f, "protocol violation: {}", why),
            Self::BitfieldNotAfterHandshake => {
                write!(f, "bitfield/HaveAll/HaveNone sent outside of handshake window")
            }
            Self::OversizedFrame(len) => write!(f, "oversized frame: {} bytes", len),
            Self::DuplicateHandshake => write!(f, "duplicate handshake"),
            Self::UnsolicitedPiece => write!(f, "unsolicited piece message"),
            Self::PeerNotSeed => write!(f, "peer is not a seed"),
            Self::BadData => write!(f, "peer sent too many invalid blocks"),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::SubPieceWriteFailed => write!(f, "sub-piece write failed"),
            Self::StorageStalled => write!(f, "storage stalled after repeated failures"),
            Self::StateFileCorrupt(why) => write!(f, "state file corrupt: {}", why),
            Self::MagnetParseFailed(why) => write!(f, "magnet parse failed: {}", why),
            Self::InfoHashMismatch => {
                write!(f, "downloaded metadata info hash mismatch")
            }
            Self::InvalidConfig(why) => write!(f, "invalid configuration: {}", why),
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::Bencode(e) => write!(f, "bencode error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Bencode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Io(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))
    }
}

/// Why a piece was rejected by the verifier, attached to `PieceRejected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    HashMismatch,
}

/// Storage-level write failure context, attached to `SubPieceWriteFailed`.
#[derive(Debug)]
pub struct WriteError {
    pub piece_index: PieceIndex,
    pub source: io::Error,
}
