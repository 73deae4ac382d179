//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default cratetorrent client id.
pub const CRATETORRENT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The default sub-piece (block) request size, 16 KiB.
pub const DEFAULT_SUB_PIECE_SIZE: u32 = crate::BLOCK_LEN;

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default cratetorrent client id,
    /// [`CRATETORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CRATETORRENT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// Number of incomplete pieces below which the scheduler enters endgame
    /// mode and may issue duplicate requests.
    pub endgame_threshold: u32,

    /// The maximum number of sub-piece requests we allow to be outstanding
    /// for a single peer at once (the request pipeline cap / MAX_WINDOW).
    pub request_pipeline_cap: u32,

    /// The size, in bytes, of a sub-piece (block) request. Always 16 KiB in
    /// practice; kept configurable for tests.
    pub sub_piece_size: u32,

    /// Sequential/streaming selector configuration. `None` means the
    /// rarest-first selector is used unconditionally.
    pub sequential: Option<SequentialConf>,

    /// Whether to run in superseeding mode once fully seeding.
    pub super_seeding: bool,

    /// Whether to re-hash on-disk pieces against the metadata on open,
    /// clearing bits that fail to verify (used to recover a missing or
    /// corrupt state file).
    pub resume_validation: bool,

    /// The port we listen for incoming peer connections on, if any.
    pub listen_port: Option<u16>,

    /// The first 8 bytes of our peer id, used to derive a full 20 byte peer
    /// id alongside a random suffix.
    pub peer_id_prefix: [u8; 8],
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 60,
            // needs testing
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
            // the standard BitTorrent recommendation
            endgame_threshold: 20,
            // matches the per-peer congestion window cap
            request_pipeline_cap: 64,
            sub_piece_size: DEFAULT_SUB_PIECE_SIZE,
            sequential: None,
            super_seeding: false,
            resume_validation: false,
            listen_port: None,
            peer_id_prefix: *b"-CT0001-",
        }
    }
}

/// Configuration for the sequential/streaming piece selector.
#[derive(Clone, Copy, Debug)]
pub struct SequentialConf {
    /// The number of pieces past the critical zone that are also prioritized
    /// sequentially, before falling back to rarest-first for the remainder.
    pub look_ahead_size: u32,

    /// The size, in bytes, of the always-highest-priority region starting at
    /// the playback position.
    pub critical_zone_size: u32,

    /// Whether to measure throughput and degrade to rarest-first when it
    /// falls below `min_speed_for_sequential`.
    pub adaptive_strategy: bool,

    /// Below this aggregate download rate (bytes/sec), the adaptive strategy
    /// switches to rarest-first.
    pub min_speed_for_sequential: u32,

    /// Whether to treat the final ~1% of the file plus the first piece as
    /// always-critical, as a heuristic for MP4 `moov` atom placement. This is
    /// a best-effort heuristic, not a format parser, and may be disabled
    /// without affecting correctness.
    pub auto_detect_moov_atom: bool,

    /// How many pieces of slack, in units of the critical zone, a seek may
    /// move without triggering a full cancel-and-refill.
    pub seek_latency_tolerance: u32,

    /// Whether peers are prioritized by how much of the critical zone they
    /// can serve when choosing whom to unchoke.
    pub enable_peer_priority: bool,

    /// Whether partially-downloaded pieces left over from a previous session
    /// are eagerly resumed instead of re-verified from scratch.
    pub enable_fast_resumption: bool,
}

impl Default for SequentialConf {
    fn default() -> Self {
        Self {
            look_ahead_size: 4,
            critical_zone_size: 4 * 1024 * 1024,
            adaptive_strategy: true,
            min_speed_for_sequential: 256 * 1024,
            auto_detect_moov_atom: true,
            seek_latency_tolerance: 1,
            enable_peer_priority: false,
            enable_fast_resumption: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_torrent_conf_defaults_are_sane() {
        let conf = TorrentConf::new("/tmp/downloads");
        assert!(conf.max_connected_peer_count >= conf.min_requested_peer_count);
        assert_eq!(conf.endgame_threshold, 20);
        assert_eq!(conf.sub_piece_size, DEFAULT_SUB_PIECE_SIZE);
        assert!(conf.sequential.is_none());
    }
}
