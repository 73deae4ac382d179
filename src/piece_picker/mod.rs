//! Picks which piece to download next (§4.2): rarest-first by default,
//! sequential for streaming, or adaptive between the two, plus the
//! file-priority skip list and endgame mode.

mod selector;

use crate::conf::TorrentConf;
use crate::error::{Error, Result};
use crate::storage_info::{FileInfo, FsStructure, StorageInfo};
use crate::{Bitfield, PieceIndex};

use selector::{AdaptiveState, Selector, SequentialParams, SequentialState};

/// Per-piece bookkeeping the selector reads to make its choice.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PieceState {
    /// Number of connected peers known to have this piece.
    pub(crate) availability: u32,
    /// Whether we've already received at least one, but not all, of this
    /// piece's blocks (preferred on a rarest-first tie to reduce the number
    /// of simultaneously in-progress pieces).
    pub(crate) has_partial_blocks: bool,
    /// 0 means "don't download" (deselected file); nonzero pieces are all
    /// currently treated as equal priority among themselves.
    pub(crate) priority: u8,
}

pub(crate) struct PiecePicker {
    /// The pieces we already have, verified and on disk.
    own: Bitfield,
    piece_count: usize,
    availability: Vec<u32>,
    /// Pieces assigned to at least one in-progress [`crate::download::PieceDownload`].
    /// Outside of endgame, a pending piece isn't picked again.
    pending: Vec<bool>,
    has_partial_blocks: Vec<bool>,
    priority: Vec<u8>,
    selector: Selector,
    play_position: PieceIndex,
    endgame: bool,
    endgame_threshold: usize,
    /// Mirrors the active sequential/adaptive strategy's critical zone
    /// length in pieces, if any; used by [`Self::needed_critical_pieces`]
    /// and by seek handling in [`Self::set_play_position`]. Zero when
    /// rarest-first is the only strategy in play.
    critical_zone_len: usize,
    /// How many pieces `play_position` may move by before it counts as a
    /// real seek (§4.2 `seek_latency_tolerance`) rather than ordinary
    /// playback advancing through the critical zone.
    seek_tolerance: usize,
}

impl PiecePicker {
    /// Derives the sequential/streaming piece-granular parameters (if
    /// configured) from `storage`'s piece length and file layout, and the
    /// strategy (rarest-first, sequential, or adaptive between the two)
    /// from [`crate::conf::TorrentConf`].
    pub(crate) fn new(storage: &StorageInfo, conf: &TorrentConf) -> Self {
        let piece_count = storage.piece_count;
        let mut critical_zone_len = 0;
        let mut seek_tolerance = 0;
        let mut strategy = match &conf.sequential {
            None => Selector::Rarest,
            Some(seq) => {
                let piece_len = (storage.piece_len as u64).max(1);
                critical_zone_len = ((seq.critical_zone_size as u64 + piece_len - 1)
                    / piece_len) as usize;
                seek_tolerance = seq.seek_latency_tolerance as usize * critical_zone_len;
                let params = SequentialParams {
                    critical_zone_len,
                    look_ahead_len: seq.look_ahead_size as usize,
                    moov_critical_pieces: Vec::new(),
                };
                if seq.adaptive_strategy {
                    Selector::Adaptive(AdaptiveState::new(
                        params,
                        seq.min_speed_for_sequential as f64,
                    ))
                } else {
                    Selector::Sequential(SequentialState::new(params))
                }
            }
        };

        if conf
            .sequential
            .as_ref()
            .map(|seq| seq.auto_detect_moov_atom)
            .unwrap_or(false)
        {
            strategy.set_moov_critical(moov_critical_pieces(storage));
        }

        Self {
            own: Bitfield::repeat(false, piece_count),
            piece_count,
            availability: vec![0; piece_count],
            pending: vec![false; piece_count],
            has_partial_blocks: vec![false; piece_count],
            priority: vec![1; piece_count],
            selector: strategy,
            play_position: 0,
            endgame: false,
            endgame_threshold: conf.endgame_threshold as usize,
            critical_zone_len,
            seek_tolerance,
        }
    }

    /// Seeds ownership from a resume state file's bitfield, without
    /// treating any of it as newly "received" (no `Have` broadcast).
    pub(crate) fn set_owned(&mut self, bitfield: Bitfield) {
        self.own = bitfield;
    }

    pub(crate) fn owned(&self) -> &Bitfield {
        &self.own
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.own.all()
    }

    /// Sets a file's pieces to priority 0 (skip) or back to normal,
    /// identified by the inclusive piece index range the file spans.
    pub(crate) fn set_piece_range_priority(
        &mut self,
        range: std::ops::Range<PieceIndex>,
        priority: u8,
    ) {
        for i in range {
            if i < self.priority.len() {
                self.priority[i] = priority;
            }
        }
    }

    /// Moves the sequential/streaming selector's playback position. A jump
    /// larger than `seek_latency_tolerance` counts as a real seek: pieces we
    /// hadn't yet received are released back to the pool so another peer
    /// can pick them up immediately instead of waiting on a stale,
    /// now-irrelevant in-flight request.
    pub(crate) fn set_play_position(&mut self, index: PieceIndex) {
        let delta = index.max(self.play_position) - index.min(self.play_position);
        if delta > self.seek_tolerance {
            for i in 0..self.piece_count {
                if self.pending[i] && !self.own[i] {
                    self.pending[i] = false;
                }
            }
        }
        self.play_position = index;
    }

    /// The pieces within the active critical zone we don't yet own, for the
    /// choke algorithm's peer-priority boost (§4.2 `enable_peer_priority`).
    /// Empty when rarest-first is the only strategy in play.
    pub(crate) fn needed_critical_pieces(&self) -> Vec<PieceIndex> {
        if self.critical_zone_len == 0 {
            return Vec::new();
        }
        let end = (self.play_position + self.critical_zone_len).min(self.piece_count);
        (self.play_position..end)
            .filter(|&i| !self.own[i] && self.priority[i] > 0)
            .collect()
    }

    /// Folds a peer's bitfield into the rarest-first availability counts.
    /// Returns whether we're interested in this peer, i.e. whether it has
    /// at least one selectable piece (nonzero priority) we don't have.
    pub(crate) fn register_availability(&mut self, bitfield: &Bitfield) -> Result<bool> {
        if bitfield.len() < self.piece_count {
            return Err(Error::ProtocolViolation("bitfield shorter than piece count"));
        }
        let mut interested = false;
        for i in 0..self.piece_count {
            if bitfield[i] {
                self.availability[i] += 1;
                if !self.own[i] && self.priority[i] > 0 {
                    interested = true;
                }
            }
        }
        Ok(interested)
    }

    /// Registers a single newly-announced piece (BEP 3 `Have`, or an
    /// `AllowedFast`/`SuggestPiece` hint treated the same way for
    /// availability purposes).
    pub(crate) fn register_have(&mut self, index: PieceIndex) -> bool {
        if index >= self.piece_count {
            return false;
        }
        self.availability[index] += 1;
        !self.own[index] && self.priority[index] > 0
    }

    /// Removes a peer's pieces from the availability counts, e.g. on
    /// disconnect.
    pub(crate) fn deregister_availability(&mut self, bitfield: &Bitfield) {
        for i in 0..self.piece_count.min(bitfield.len()) {
            if bitfield[i] && self.availability[i] > 0 {
                self.availability[i] -= 1;
            }
        }
    }

    /// Picks the next piece to download, per the active strategy, and marks
    /// it pending so it isn't picked again (unless in endgame).
    pub(crate) fn pick_piece(&mut self) -> Option<PieceIndex> {
        let own = &self.own;
        let pending = &self.pending;
        let priority = &self.priority;
        let availability = &self.availability;
        let has_partial_blocks = &self.has_partial_blocks;
        let endgame = self.endgame;

        let states: Vec<PieceState> = (0..self.piece_count)
            .map(|i| PieceState {
                availability: availability[i],
                has_partial_blocks: has_partial_blocks[i],
                priority: priority[i],
            })
            .collect();

        let candidates = (0..self.piece_count).filter(|&i| {
            !own[i] && priority[i] > 0 && (endgame || !pending[i])
        });
        let candidates = candidates.map(|i| (i, &states[i]));

        let picked = self.selector.pick(candidates, self.play_position);
        if let Some(index) = picked {
            self.pending[index] = true;
        }
        picked
    }

    /// Marks a piece as having at least one block outstanding, used by the
    /// rarest-first tie-break to prefer finishing in-progress pieces.
    pub(crate) fn mark_partial(&mut self, index: PieceIndex) {
        if index < self.has_partial_blocks.len() {
            self.has_partial_blocks[index] = true;
        }
    }

    /// Marks `index` as verified and owned, the final step of a successful
    /// download. Enters endgame mode once remaining pieces drop below the
    /// configured threshold.
    pub(crate) fn received_piece(&mut self, index: PieceIndex) {
        if index >= self.piece_count {
            return;
        }
        self.own.set(index, true);
        self.pending[index] = false;
        self.has_partial_blocks[index] = false;

        let missing = self.piece_count - self.own.count_ones();
        if missing <= self.endgame_threshold {
            self.endgame = true;
        }
    }

    /// Reverts a piece's `pending` flag, e.g. after its sole peer
    /// disconnects before completing it.
    pub(crate) fn unpick_piece(&mut self, index: PieceIndex) {
        if index < self.pending.len() {
            self.pending[index] = false;
        }
    }

    /// Reverts a piece that was optimistically marked owned by
    /// [`Self::received_piece`] but then failed disk hash verification:
    /// clears the owned bit so it becomes selectable again.
    pub(crate) fn reject_piece(&mut self, index: PieceIndex) {
        if index >= self.piece_count {
            return;
        }
        self.own.set(index, false);
        self.pending[index] = false;
        self.endgame = self.piece_count - self.own.count_ones() <= self.endgame_threshold;
    }

    pub(crate) fn is_endgame(&self) -> bool {
        self.endgame
    }

    /// The rarest piece we own that isn't in `offered`, for BEP 16
    /// superseeding: trickling out the rarest pieces first spreads them
    /// across the swarm fastest. Ties broken by lowest index.
    pub(crate) fn rarest_owned_unoffered(&self, offered: &[PieceIndex]) -> Option<PieceIndex> {
        (0..self.piece_count)
            .filter(|&i| self.own[i] && !offered.contains(&i))
            .min_by_key(|&i| (self.availability[i], i))
    }
}

fn is_mp4_like(path: &std::path::Path) -> bool {
    matches!(
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref(),
        Some("mp4") | Some("m4v") | Some("mov")
    )
}

/// Computes the sorted, deduplicated set of pieces the moov-atom heuristic
/// always treats as critical: each MP4-like file's first piece (unconditional,
/// per §4.2) and its trailing ~1% (gated by [`selector::moov_atom_bias`]).
fn moov_critical_pieces(storage: &StorageInfo) -> Vec<PieceIndex> {
    let files: Vec<&FileInfo> = match &storage.structure {
        FsStructure::File(file) => vec![file],
        FsStructure::Archive { files } => files.iter().collect(),
    };
    let piece_len = (storage.piece_len as u64).max(1);
    let last_index = storage.piece_count.saturating_sub(1);

    let mut pieces = std::collections::BTreeSet::new();
    for file in files {
        if !is_mp4_like(&file.path) || file.len == 0 {
            continue;
        }
        let first_piece = (file.torrent_offset / piece_len) as usize;
        pieces.insert(first_piece.min(last_index));

        if selector::moov_atom_bias(true, true) {
            let trailing_zone_len = (file.len / 100).max(piece_len);
            let trailing_start = file.torrent_end_offset().saturating_sub(trailing_zone_len);
            let trailing_start_piece = (trailing_start / piece_len) as usize;
            let trailing_end_piece = ((file.torrent_end_offset().saturating_sub(1)) / piece_len) as usize;
            for index in trailing_start_piece..=trailing_end_piece.min(last_index) {
                pieces.insert(index);
            }
        }
    }
    pieces.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::TorrentConf;

    fn test_storage(piece_count: usize) -> StorageInfo {
        let piece_len = crate::BLOCK_LEN;
        let download_len = piece_count as u64 * piece_len as u64;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: piece_len,
            download_len,
            download_dir: std::path::PathBuf::from("/tmp"),
            structure: FsStructure::File(FileInfo {
                path: std::path::PathBuf::from("/tmp/f"),
                len: download_len,
                torrent_offset: 0,
                pieces_root: None,
            }),
        }
    }

    fn picker(piece_count: usize) -> PiecePicker {
        PiecePicker::new(&test_storage(piece_count), &TorrentConf::new("/tmp"))
    }

    #[test]
    fn test_register_availability_reports_interest() {
        let mut picker = picker(4);
        let mut bitfield = Bitfield::repeat(false, 4);
        bitfield.set(2, true);
        let interested = picker.register_availability(&bitfield).unwrap();
        assert!(interested);
    }

    #[test]
    fn test_pick_piece_respects_priority_zero() {
        let mut picker = picker(3);
        picker.set_piece_range_priority(0..1, 0);
        let bitfield = Bitfield::repeat(true, 3);
        picker.register_availability(&bitfield).unwrap();
        let mut seen = Vec::new();
        while let Some(index) = picker.pick_piece() {
            seen.push(index);
        }
        assert!(!seen.contains(&0));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_received_piece_marks_owned_and_clears_pending() {
        let mut picker = picker(2);
        let bitfield = Bitfield::repeat(true, 2);
        picker.register_availability(&bitfield).unwrap();
        let picked = picker.pick_piece().unwrap();
        picker.received_piece(picked);
        assert!(picker.owned()[picked]);
        // picking again shouldn't return the completed piece
        let next = picker.pick_piece();
        assert_ne!(next, Some(picked));
    }

    #[test]
    fn test_endgame_triggers_near_completion() {
        let mut conf = TorrentConf::new("/tmp");
        conf.endgame_threshold = 1;
        let mut picker = PiecePicker::new(&test_storage(2), &conf);
        let bitfield = Bitfield::repeat(true, 2);
        picker.register_availability(&bitfield).unwrap();
        assert!(!picker.is_endgame());
        let first = picker.pick_piece().unwrap();
        picker.received_piece(first);
        assert!(picker.is_endgame());
    }

    #[test]
    fn test_seek_beyond_tolerance_releases_pending() {
        let mut conf = TorrentConf::new("/tmp");
        conf.sequential = Some(crate::conf::SequentialConf {
            critical_zone_size: crate::BLOCK_LEN,
            seek_latency_tolerance: 1,
            ..crate::conf::SequentialConf::default()
        });
        let mut picker = PiecePicker::new(&test_storage(10), &conf);
        let bitfield = Bitfield::repeat(true, 10);
        picker.register_availability(&bitfield).unwrap();
        let picked = picker.pick_piece().unwrap();
        assert!(picker.pending[picked]);
        picker.set_play_position(picked + 5);
        assert!(!picker.pending[picked]);
    }

    #[test]
    fn test_deregister_availability_decrements() {
        let mut picker = picker(2);
        let bitfield = Bitfield::repeat(true, 2);
        picker.register_availability(&bitfield).unwrap();
        picker.deregister_availability(&bitfield);
        assert_eq!(picker.availability[0], 0);
    }
}
