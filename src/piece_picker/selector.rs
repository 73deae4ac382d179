//! Piece selection strategies (§4.2): rarest-first, sequential/streaming,
//! and an adaptive strategy that switches between the two based on
//! measured throughput.

use std::time::{Duration, Instant};

use crate::PieceIndex;

use super::PieceState;

/// Piece-granular sequential/streaming parameters, derived by the picker
/// from [`crate::conf::SequentialConf`]'s byte-denominated fields and the
/// torrent's piece length.
#[derive(Clone, Debug, Default)]
pub(crate) struct SequentialParams {
    pub(crate) critical_zone_len: usize,
    pub(crate) look_ahead_len: usize,
    /// Extra pieces always treated as in the critical zone regardless of
    /// play position, e.g. an MP4's first piece and its trailing moov-atom
    /// region (§4.2, `auto_detect_moov_atom`). Empty unless that detection
    /// is enabled and the torrent actually has an MP4-like file.
    pub(crate) moov_critical_pieces: Vec<PieceIndex>,
}

/// Which algorithm orders candidate pieces.
#[derive(Debug)]
pub(crate) enum Selector {
    Rarest,
    Sequential(SequentialState),
    Adaptive(AdaptiveState),
}

#[derive(Debug)]
pub(crate) struct SequentialState {
    params: SequentialParams,
}

impl SequentialState {
    pub(crate) fn new(params: SequentialParams) -> Self {
        Self { params }
    }

    pub(crate) fn set_moov_critical(&mut self, pieces: Vec<PieceIndex>) {
        self.params.moov_critical_pieces = pieces;
    }
}

/// Switches between sequential and rarest-first based on a throughput
/// threshold (§4.2: below `min_speed_for_sequential`, degrade to
/// rarest-first so playback has the best odds of finding data anywhere in
/// the swarm; above it, return to sequential for smooth in-order
/// playback).
#[derive(Debug)]
pub(crate) struct AdaptiveState {
    sequential: SequentialState,
    is_sequential: bool,
    threshold_bytes_per_sec: f64,
    last_switch: Option<Instant>,
    min_dwell: Duration,
}

impl AdaptiveState {
    pub(crate) fn new(params: SequentialParams, threshold_bytes_per_sec: f64) -> Self {
        Self {
            sequential: SequentialState::new(params),
            is_sequential: true,
            threshold_bytes_per_sec,
            last_switch: None,
            min_dwell: Duration::from_secs(10),
        }
    }

    /// Re-evaluates which mode to use, given the current measured
    /// throughput. Debounced by `min_dwell` to avoid thrashing.
    pub(crate) fn update(&mut self, now: Instant, throughput: f64) {
        if let Some(last) = self.last_switch {
            if now.saturating_duration_since(last) < self.min_dwell {
                return;
            }
        }
        let should_be_sequential = throughput >= self.threshold_bytes_per_sec;
        if should_be_sequential != self.is_sequential {
            self.is_sequential = should_be_sequential;
            self.last_switch = Some(now);
        }
    }
}

/// Returns whether a piece should be biased into the critical zone as part
/// of the "moov atom" heuristic: a non-contractual nudge that treats an
/// MP4 file's trailing ~1% (plus its first piece, handled separately by
/// the caller) as always-critical, since that's where the metadata atom
/// commonly lands for files remuxed without `-movflags faststart`.
/// `file_is_mp4` and `piece_is_in_trailing_zone` are supplied by the
/// caller, which has the file-layout context this module doesn't.
pub(crate) fn moov_atom_bias(file_is_mp4: bool, piece_is_in_trailing_zone: bool) -> bool {
    file_is_mp4 && piece_is_in_trailing_zone
}

impl Selector {
    /// Seeds the moov-atom critical-piece set (§4.2, `auto_detect_moov_atom`)
    /// for a sequential or adaptive selector; a no-op for pure rarest-first.
    pub(crate) fn set_moov_critical(&mut self, pieces: Vec<PieceIndex>) {
        match self {
            Self::Rarest => {}
            Self::Sequential(state) => state.set_moov_critical(pieces),
            Self::Adaptive(state) => state.sequential.set_moov_critical(pieces),
        }
    }

    /// Chooses the next piece to download out of `candidates` (pieces we
    /// don't have, aren't fully requested, and have nonzero priority), given
    /// each candidate's peer availability count (for rarest-first) and
    /// distance from `play_position` (for sequential).
    pub(crate) fn pick<'a>(
        &self,
        candidates: impl Iterator<Item = (PieceIndex, &'a PieceState)>,
        play_position: PieceIndex,
    ) -> Option<PieceIndex> {
        match self {
            Self::Rarest => Self::pick_rarest(candidates),
            Self::Sequential(state) => Self::pick_sequential(candidates, play_position, &state.params),
            Self::Adaptive(state) => {
                if state.is_sequential {
                    Self::pick_sequential(candidates, play_position, &state.sequential.params)
                } else {
                    Self::pick_rarest(candidates)
                }
            }
        }
    }

    fn pick_rarest<'a>(
        candidates: impl Iterator<Item = (PieceIndex, &'a PieceState)>,
    ) -> Option<PieceIndex> {
        // tie-break: among equally rare pieces, prefer partially-downloaded
        // ones (fewer pieces in flight at once), then lowest index
        candidates
            .min_by_key(|(index, state)| {
                (state.availability, !state.has_partial_blocks, *index)
            })
            .map(|(index, _)| index)
    }

    fn pick_sequential<'a>(
        candidates: impl Iterator<Item = (PieceIndex, &'a PieceState)>,
        play_position: PieceIndex,
        params: &SequentialParams,
    ) -> Option<PieceIndex> {
        let critical_end = play_position + params.critical_zone_len;
        let window_end = critical_end + params.look_ahead_len;

        let mut best: Option<(PieceIndex, &PieceState)> = None;
        let mut best_in_critical = false;
        for (index, candidate_state) in candidates {
            if index < play_position {
                // already played past; only worth fetching for rarest-first
                // tail below
                continue;
            }
            let in_critical = index < critical_end
                || params.moov_critical_pieces.binary_search(&index).is_ok();
            let in_window = index < window_end || in_critical;
            if !in_window && best.is_some() {
                continue;
            }
            let better = match &best {
                None => true,
                Some((best_index, best_state)) => {
                    if in_critical && !best_in_critical {
                        true
                    } else if !in_critical && best_in_critical {
                        false
                    } else if in_critical {
                        // within the critical zone strict playback order
                        index < *best_index
                    } else {
                        // look-ahead window falls back to rarest-first
                        candidate_state.availability < best_state.availability
                    }
                }
            };
            if better {
                best = Some((index, candidate_state));
                best_in_critical = in_critical;
            }
        }
        best.map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(availability: u32, has_partial_blocks: bool) -> PieceState {
        PieceState {
            availability,
            has_partial_blocks,
            priority: 1,
        }
    }

    #[test]
    fn test_rarest_picks_lowest_availability() {
        let states = vec![state(5, false), state(1, false), state(3, false)];
        let candidates = states.iter().enumerate().map(|(i, s)| (i, s));
        let picked = Selector::Rarest.pick(candidates, 0);
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn test_rarest_prefers_partial_on_tie() {
        let states = vec![state(2, false), state(2, true)];
        let candidates = states.iter().enumerate().map(|(i, s)| (i, s));
        let picked = Selector::Rarest.pick(candidates, 0);
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn test_sequential_prefers_critical_zone_order() {
        let params = SequentialParams { critical_zone_len: 2, look_ahead_len: 5 };
        let selector = Selector::Sequential(SequentialState::new(params));
        let states: Vec<_> = (0..10).map(|_| state(1, false)).collect();
        let candidates = states.iter().enumerate().map(|(i, s)| (i, s));
        let picked = selector.pick(candidates, 3);
        assert_eq!(picked, Some(3));
    }

    #[test]
    fn test_sequential_look_ahead_falls_back_to_rarest() {
        let params = SequentialParams { critical_zone_len: 0, look_ahead_len: 5 };
        let selector = Selector::Sequential(SequentialState::new(params));
        let mut states: Vec<_> = (0..10).map(|_| state(5, false)).collect();
        states[2] = state(1, false);
        let candidates = states.iter().enumerate().map(|(i, s)| (i, s));
        let picked = selector.pick(candidates, 0);
        assert_eq!(picked, Some(2));
    }

    #[test]
    fn test_adaptive_switches_after_min_dwell() {
        let params = SequentialParams { critical_zone_len: 1, look_ahead_len: 1 };
        let mut state = AdaptiveState::new(params, 1000.0);
        assert!(state.is_sequential);
        let t0 = Instant::now();
        // below the threshold: degrade to rarest-first
        state.update(t0, 500.0);
        // no prior switch recorded, so the very first update is allowed
        // through even though min_dwell hasn't elapsed
        assert!(!state.is_sequential);
    }

    #[test]
    fn test_adaptive_returns_to_sequential_above_threshold() {
        let params = SequentialParams { critical_zone_len: 1, look_ahead_len: 1 };
        let mut state = AdaptiveState::new(params, 1000.0);
        let t0 = Instant::now();
        state.update(t0, 500.0);
        assert!(!state.is_sequential);
        let t1 = t0 + Duration::from_secs(20);
        state.update(t1, 5000.0);
        assert!(state.is_sequential);
    }
}
