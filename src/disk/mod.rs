//! The disk I/O actor (§5): owns all file handles and the write/read buffers
//! for in-progress pieces, verifies completed pieces against their expected
//! hash (v1 SHA-1 or v2 SHA-256/Merkle, per torrent version), and persists
//! resume state.

mod io;
mod state;
mod verify;

use std::fmt;

use tokio::sync::mpsc;
use tokio::task;

use crate::error::{Error, Result, WriteError};
use crate::storage_info::StorageInfo;
use crate::{BlockInfo, Bitfield, PieceIndex, Sha1Hash, Sha256Hash, TorrentId};

pub(crate) use state::StateFile;

/// Commands sent from a torrent (or the engine) to the disk actor.
pub(crate) enum Command {
    /// Allocates file handles and disk-side bookkeeping for a new torrent.
    /// `info_hash_hex` names the resume state file (§3:
    /// `<save_path>/<hex_info_hash>.bt.state`) and is also used to open and
    /// migrate any resume state already on disk from a previous run.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: PieceHashes,
        info_hash_hex: String,
        /// Whether to re-hash every piece the resume state file claims we
        /// already have, clearing any bit that fails verification.
        resume_validation: bool,
    },
    /// Queues a downloaded block to be written, hashed, and (if the piece
    /// completes and verifies) flushed to its files.
    WriteBlock { id: TorrentId, info: BlockInfo, data: Vec<u8> },
    /// Reads a block back off disk to serve an upload request.
    ReadBlock { id: TorrentId, info: BlockInfo },
    /// Persists the torrent's current bitfield and stats to its state file.
    /// `data` is the already-encoded `StateFile` produced by the torrent
    /// task, which owns the bitfield and counters; the disk actor's job is
    /// only the blocking file write.
    SaveState { id: TorrentId, data: Vec<u8> },
    /// Removes the torrent's bookkeeping (files are left on disk).
    RemoveTorrent { id: TorrentId },
    Shutdown,
}

/// The concatenated expected piece hashes for a torrent: v1 SHA-1 hashes,
/// v2 SHA-256 piece-layer leaf hashes, or both for a hybrid torrent.
#[derive(Clone, Debug)]
pub(crate) enum PieceHashes {
    V1(Vec<u8>),
    V2 { piece_layers: Vec<Sha256Hash> },
    Hybrid { v1: Vec<u8>, piece_layers: Vec<Sha256Hash> },
}

/// Alerts sent from the disk actor to the engine (not torrent-specific).
pub(crate) enum Alert {
    TorrentAllocation(std::result::Result<TorrentAllocation, NewTorrentError>),
}

pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    pub alert_port: TorrentAlertReceiver,
    /// The piece bitfield recovered from an existing resume state file, if
    /// one was found and decoded successfully; `None` for a fresh torrent
    /// or a state file that failed to validate.
    pub resume_bitfield: Option<Bitfield>,
}

/// Alerts sent from the disk actor to a specific torrent.
pub(crate) enum TorrentAlert {
    BatchWrite(std::result::Result<BatchWrite, WriteError>),
    ReadBlock(Result<(BlockInfo, Vec<u8>)>),
    StateSaved(Result<()>),
}

pub(crate) struct BatchWrite {
    pub piece_index: PieceIndex,
    /// The written blocks; empty if the piece failed hash verification, in
    /// which case nothing was flushed to the files.
    pub blocks: Vec<BlockInfo>,
    pub is_piece_valid: Option<bool>,
}

#[derive(Debug)]
pub(crate) enum NewTorrentError {
    AlreadyExists,
    Io(std::io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;
pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// A lightweight handle torrents and peer sessions use to talk to the
/// single shared disk actor task without holding a lock on it directly.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
}

impl DiskHandle {
    /// Spawns the disk actor on a blocking-friendly tokio task and returns
    /// a handle plus its alert channel.
    pub(crate) fn spawn() -> Result<(Self, AlertReceiver)> {
        let (disk, cmd_chan, alert_port) = io::Disk::new()?;
        let mut disk = disk;
        task::spawn(async move {
            if let Err(e) = disk.start().await {
                log::error!("Disk event loop exited with error: {}", e);
            }
        });
        Ok((Self { cmd_chan }, alert_port))
    }

    pub(crate) fn allocate_new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: PieceHashes,
        info_hash_hex: String,
        resume_validation: bool,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::NewTorrent {
            id,
            info,
            piece_hashes,
            info_hash_hex,
            resume_validation,
        })?)
    }

    pub(crate) fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::WriteBlock { id, info, data })?)
    }

    pub(crate) fn read_block(&self, id: TorrentId, info: BlockInfo) -> Result<()> {
        Ok(self.cmd_chan.send(Command::ReadBlock { id, info })?)
    }

    pub(crate) fn save_state(&self, id: TorrentId, data: Vec<u8>) -> Result<()> {
        Ok(self.cmd_chan.send(Command::SaveState { id, data })?)
    }

    pub(crate) fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        Ok(self.cmd_chan.send(Command::RemoveTorrent { id })?)
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        Ok(self.cmd_chan.send(Command::Shutdown)?)
    }
}

/// Reasons a completed piece failed verification, passed back up so the
/// swarm controller can account bad data against the peer(s) that sent it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PieceRejection {
    pub index: PieceIndex,
}

pub(crate) fn verify_v1_piece(data: &[u8], expected: &Sha1Hash) -> bool {
    verify::verify_v1(data, expected)
}

pub(crate) fn verify_v2_piece(data: &[u8], expected_root: &Sha256Hash) -> bool {
    verify::verify_v2_leaf(data, expected_root)
}
