//! Tracking of an in-progress piece download: which of its blocks have been
//! requested, received, and are still missing (§4.1, §4.2 "endgame").

use std::time::Instant;

use crate::{block_count, block_len, BlockInfo, PieceIndex};

/// One block's state within a [`PieceDownload`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockStatus {
    Missing,
    Requested,
    Received,
}

/// Tracks the download progress of a single piece across however many
/// blocks it's split into, independent of which peer each block is
/// requested from (a piece may be downloaded from several peers at once
/// during endgame).
#[derive(Debug)]
pub(crate) struct PieceDownload {
    index: PieceIndex,
    piece_len: u32,
    blocks: Vec<BlockStatus>,
    /// When each block still in `Requested` state was last (re-)requested,
    /// used by the congestion window to decide when a block has timed out
    /// and should be re-requested or, in endgame, requested again from a
    /// different peer.
    requested_at: Vec<Option<Instant>>,
}

impl PieceDownload {
    pub(crate) fn new(index: PieceIndex, piece_len: u32) -> Self {
        let block_count = block_count(piece_len);
        Self {
            index,
            piece_len,
            blocks: vec![BlockStatus::Missing; block_count],
            requested_at: vec![None; block_count],
        }
    }

    pub(crate) fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Picks up to `count` missing blocks, appending them to `blocks` as
    /// [`BlockInfo`]s and marking them `Requested`.
    pub(crate) fn pick_blocks(&mut self, count: usize, blocks: &mut Vec<BlockInfo>) {
        self.pick_blocks_at(count, blocks, Instant::now())
    }

    pub(crate) fn pick_blocks_at(
        &mut self,
        count: usize,
        blocks: &mut Vec<BlockInfo>,
        now: Instant,
    ) {
        let mut picked = 0;
        for i in 0..self.blocks.len() {
            if picked == count {
                break;
            }
            if self.blocks[i] == BlockStatus::Missing {
                self.blocks[i] = BlockStatus::Requested;
                self.requested_at[i] = Some(now);
                blocks.push(BlockInfo {
                    piece_index: self.index,
                    offset: i as u32 * crate::BLOCK_LEN,
                    len: block_len(self.piece_len, i),
                });
                picked += 1;
            }
        }
    }

    /// Endgame mode: re-picks blocks that are still outstanding (but already
    /// requested from someone else), for duplicate requests to other peers.
    /// Only blocks requested longer than `min_age` ago are eligible, so we
    /// don't immediately duplicate a request we just made.
    pub(crate) fn pick_duplicate_blocks(
        &self,
        count: usize,
        min_age: std::time::Duration,
        now: Instant,
        out: &mut Vec<BlockInfo>,
    ) {
        let mut picked = 0;
        for i in 0..self.blocks.len() {
            if picked == count {
                break;
            }
            if self.blocks[i] == BlockStatus::Requested {
                if let Some(at) = self.requested_at[i] {
                    if now.saturating_duration_since(at) >= min_age {
                        out.push(BlockInfo {
                            piece_index: self.index,
                            offset: i as u32 * crate::BLOCK_LEN,
                            len: block_len(self.piece_len, i),
                        });
                        picked += 1;
                    }
                }
            }
        }
    }

    pub(crate) fn received_block(&mut self, block: BlockInfo) {
        let i = block.index_in_piece();
        if i < self.blocks.len() {
            self.blocks[i] = BlockStatus::Received;
            self.requested_at[i] = None;
        }
    }

    /// Reverts a block to `Missing`, e.g. after a timeout or a `RejectRequest`.
    pub(crate) fn time_out_block(&mut self, block: BlockInfo) {
        let i = block.index_in_piece();
        if i < self.blocks.len() && self.blocks[i] == BlockStatus::Requested {
            self.blocks[i] = BlockStatus::Missing;
            self.requested_at[i] = None;
        }
    }

    pub(crate) fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|s| **s != BlockStatus::Received)
            .count()
    }

    /// Returns blocks that have been `Requested` for longer than `timeout`,
    /// relative to `now`, for the per-peer congestion window's RTO-driven
    /// re-request logic (§4.1).
    pub(crate) fn timed_out_blocks(
        &self,
        timeout: std::time::Duration,
        now: Instant,
    ) -> Vec<BlockInfo> {
        self.blocks
            .iter()
            .zip(self.requested_at.iter())
            .enumerate()
            .filter_map(|(i, (status, at))| {
                if *status == BlockStatus::Requested {
                    if let Some(at) = at {
                        if now.saturating_duration_since(*at) >= timeout {
                            return Some(BlockInfo {
                                piece_index: self.index,
                                offset: i as u32 * crate::BLOCK_LEN,
                                len: block_len(self.piece_len, i),
                            });
                        }
                    }
                }
                None
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pick_blocks_marks_requested() {
        let mut download = PieceDownload::new(0, crate::BLOCK_LEN * 2);
        let mut blocks = Vec::new();
        download.pick_blocks(1, &mut blocks);
        assert_eq!(blocks.len(), 1);
        assert_eq!(download.count_missing_blocks(), 2);

        let mut more = Vec::new();
        download.pick_blocks(5, &mut more);
        assert_eq!(more.len(), 1);
    }

    #[test]
    fn test_received_block_completes_piece() {
        let mut download = PieceDownload::new(0, crate::BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(1, &mut blocks);
        assert_eq!(download.count_missing_blocks(), 1);
        download.received_block(blocks[0]);
        assert_eq!(download.count_missing_blocks(), 0);
    }

    #[test]
    fn test_timed_out_blocks() {
        let mut download = PieceDownload::new(0, crate::BLOCK_LEN);
        let mut blocks = Vec::new();
        let t0 = Instant::now();
        download.pick_blocks_at(1, &mut blocks, t0);
        let later = t0 + Duration::from_secs(10);
        let timed_out = download.timed_out_blocks(Duration::from_secs(5), later);
        assert_eq!(timed_out.len(), 1);
        assert_eq!(download.timed_out_blocks(Duration::from_secs(5), t0).len(), 0);
    }

    #[test]
    fn test_pick_duplicate_blocks_only_after_min_age() {
        let mut download = PieceDownload::new(0, crate::BLOCK_LEN);
        let mut blocks = Vec::new();
        let t0 = Instant::now();
        download.pick_blocks_at(1, &mut blocks, t0);

        let mut dup = Vec::new();
        download.pick_duplicate_blocks(1, Duration::from_secs(5), t0, &mut dup);
        assert!(dup.is_empty(), "too soon to duplicate");

        let later = t0 + Duration::from_secs(6);
        download.pick_duplicate_blocks(1, Duration::from_secs(5), later, &mut dup);
        assert_eq!(dup.len(), 1);
    }
}
