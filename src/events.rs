//! The typed event union broadcast to external listeners (§6, §9).
//!
//! One shape per event, flattened over all subsystems, following the
//! "tagged variant" design note in spec.md §9. External collaborators (the
//! tracker client, DHT, HTTP streaming server, UPnP manager, CLI driver)
//! subscribe to this stream instead of reaching into engine internals.

use std::path::PathBuf;

use crate::error::RejectReason;
use crate::{PieceIndex, TorrentId};

/// An event published by the core to external listeners.
#[derive(Clone, Debug)]
pub enum Event {
    /// A torrent task has started its event loop.
    TaskStarted(TorrentId),
    /// A torrent finished downloading all selected pieces.
    TaskCompleted(TorrentId),
    /// A torrent task finished graceful shutdown (`TorrentTask::stop`).
    TaskStopped(TorrentId),
    /// A torrent task transitioned to `Stopped(error)` due to a fatal,
    /// torrent-global error.
    TaskErrored(TorrentId, String),
    /// The state file was flushed to disk.
    StateFileUpdated(TorrentId),
    /// A piece passed hash verification and its bit was set.
    PieceAccepted(TorrentId, PieceIndex),
    /// A piece failed hash verification and was re-queued.
    PieceRejected(TorrentId, PieceIndex, RejectReason),
    /// A block was read from disk to serve an upload request.
    SubPieceReadCompleted(TorrentId, PieceIndex),
    /// A block was written to its file region(s).
    SubPieceWriteCompleted(TorrentId, PieceIndex),
    /// A block failed to write to one or more of its file regions.
    SubPieceWriteFailed(TorrentId, PieceIndex),
    /// A file reached its full declared length on disk.
    FileCompleted(TorrentId, PathBuf),
    /// Progress of the `ut_metadata` info dict download, in `[0, 1]`.
    MetaDataDownloadProgress(TorrentId, f64),
    /// The info dict was fully downloaded and its hash verified.
    MetaDataDownloadComplete(TorrentId, Vec<u8>),
}
