//! The swarm controller (§4.4): owns all of a torrent's peer sessions,
//! mediates disk reads for upload requests, and runs the choke algorithm
//! (standard tit-for-tat plus optimistic unchoke) and BEP 16 superseeding.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, RwLock};
use tokio::task;

use crate::conf::TorrentConf;
use crate::counter::ThroughputCounter;
use crate::disk::DiskHandle;
use crate::error::Result;
use crate::peer::{self, PeerEvent, PeerEventReceiver, PeerEventSender, PeerSession};
use crate::piece_picker::PiecePicker;
use crate::torrent::SharedStatus;
use crate::{Bitfield, BlockInfo, PieceIndex};

/// How often the choke algorithm re-evaluates who to unchoke.
pub(crate) const CHOKE_TICK_INTERVAL: Duration = Duration::from_secs(10);
/// Every this-many choke ticks, an additional interested peer is unchoked
/// regardless of rate, to discover potentially better peers.
const OPTIMISTIC_UNCHOKE_EVERY: u32 = 3;
/// Peers kept unchoked by rate, not counting the optimistic slot.
const RATE_UNCHOKE_SLOT_COUNT: usize = 4;
/// Window over which upload/download rate is averaged for the choke decision.
const RATE_WINDOW: Duration = Duration::from_secs(20);
/// How long a repeatedly-failing address is blacklisted before we'll try it
/// again.
const BLACKLIST_DURATION: Duration = Duration::from_secs(5 * 60);
/// Consecutive connection failures before an address is blacklisted.
const MAX_CONNECT_FAILURES: u32 = 3;
/// How many candidates buffered at capacity we remember; older ones are
/// dropped first.
const MAX_BUFFERED_CANDIDATES: usize = 200;
/// Newly-connected peers younger than this are favored for the optimistic
/// unchoke slot (§4.4), so we actually learn something about them.
const NEWLY_CONNECTED_AGE: Duration = Duration::from_secs(60);

struct PeerEntry {
    cmd: peer::Sender,
    is_interested: bool,
    is_choked: bool,
    upload_rate: ThroughputCounter,
    download_rate: ThroughputCounter,
    last_downloaded: u64,
    last_uploaded: u64,
    /// Superseeding: the single piece we've offered this peer and are
    /// waiting for it to request, so we don't offer another until it does.
    superseed_piece: Option<PieceIndex>,
    /// The peer's last-known piece availability, folded in from bitfield and
    /// `Have` announcements; used by the `enable_peer_priority` choke boost.
    pieces: Option<Bitfield>,
    connected_at: Instant,
}

impl PeerEntry {
    fn new(cmd: peer::Sender) -> Self {
        Self {
            cmd,
            is_interested: false,
            is_choked: true,
            upload_rate: ThroughputCounter::new(RATE_WINDOW),
            download_rate: ThroughputCounter::new(RATE_WINDOW),
            last_downloaded: 0,
            last_uploaded: 0,
            superseed_piece: None,
            pieces: None,
            connected_at: Instant::now(),
        }
    }
}

/// Tracks a misbehaving or unreachable address so we back off instead of
/// retrying it every time it's handed back to us (§4.4).
struct FailureEntry {
    count: u32,
    blacklisted_until: Option<Instant>,
}

pub(crate) struct PeersManager {
    status: Arc<SharedStatus>,
    piece_picker: Arc<RwLock<PiecePicker>>,
    disk: DiskHandle,
    conf: TorrentConf,
    peers: HashMap<SocketAddr, PeerEntry>,
    /// FIFO of peers waiting on a disk read for a given block, so a read
    /// completion (which carries no peer identity) can be routed back.
    pending_reads: HashMap<BlockInfo, VecDeque<SocketAddr>>,
    event_chan: PeerEventSender,
    event_port: PeerEventReceiver,
    tick_count: u32,
    super_seeding: bool,
    /// Accumulated counters from peers that have since disconnected, so
    /// `total_bytes` reflects the whole session, not just currently
    /// connected peers.
    disconnected_downloaded: u64,
    disconnected_uploaded: u64,
    /// Per-address connection failure bookkeeping (§4.4): repeated failures
    /// earn a temporary blacklist instead of an endless retry loop.
    failures: HashMap<SocketAddr, FailureEntry>,
    /// Candidate addresses offered to us while at capacity, tried again as
    /// slots free up instead of being discarded outright.
    buffered_candidates: VecDeque<SocketAddr>,
}

impl PeersManager {
    pub(crate) fn new(
        status: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        conf: TorrentConf,
    ) -> Self {
        let (event_chan, event_port) = mpsc::unbounded_channel();
        let super_seeding = conf.super_seeding;
        Self {
            status,
            piece_picker,
            disk,
            conf,
            peers: HashMap::new(),
            pending_reads: HashMap::new(),
            event_chan,
            event_port,
            tick_count: 0,
            super_seeding,
            disconnected_downloaded: 0,
            disconnected_uploaded: 0,
            failures: HashMap::new(),
            buffered_candidates: VecDeque::new(),
        }
    }

    /// Connects to a newly discovered peer address and registers its
    /// session, unless we're already connected to it, it's blacklisted, or
    /// we're at capacity (in which case it's buffered for later instead of
    /// dropped, §4.4).
    pub(crate) fn add_peer(&mut self, addr: SocketAddr) {
        if self.peers.contains_key(&addr) {
            return;
        }
        if let Some(failure) = self.failures.get(&addr) {
            if failure
                .blacklisted_until
                .map_or(false, |until| Instant::now() < until)
            {
                log::debug!("Torrent {} address {} still blacklisted", self.status.id, addr);
                return;
            }
        }
        if self.peers.len() >= self.conf.max_connected_peer_count {
            log::debug!("Torrent {} at peer capacity, buffering {}", self.status.id, addr);
            if !self.buffered_candidates.contains(&addr) {
                if self.buffered_candidates.len() >= MAX_BUFFERED_CANDIDATES {
                    self.buffered_candidates.pop_front();
                }
                self.buffered_candidates.push_back(addr);
            }
            return;
        }

        self.connect_peer(addr);
    }

    fn connect_peer(&mut self, addr: SocketAddr) {
        let (session, cmd) = PeerSession::outbound(
            Arc::clone(&self.status),
            Arc::clone(&self.piece_picker),
            self.disk.clone(),
            self.event_chan.clone(),
            addr,
        );
        self.peers.insert(addr, PeerEntry::new(cmd));

        let report_chan = self.event_chan.clone();
        task::spawn(async move {
            let mut session = session;
            let had_error = if let Err(e) = session.start().await {
                log::info!("Peer {} session ended: {}", addr, e);
                true
            } else {
                false
            };
            let _ = report_chan.send(PeerEvent::Disconnected { addr, had_error });
        });
    }

    /// Registers an already-accepted inbound connection (§4.4 `listen_port`)
    /// the same way as an outbound one, modulo connection direction.
    pub(crate) fn add_inbound_peer(&mut self, addr: SocketAddr, socket: tokio::net::TcpStream) {
        if self.peers.contains_key(&addr) || self.peers.len() >= self.conf.max_connected_peer_count {
            log::debug!("Torrent {} dropping inbound connection from {}", self.status.id, addr);
            return;
        }
        let (session, cmd) = PeerSession::inbound(
            Arc::clone(&self.status),
            Arc::clone(&self.piece_picker),
            self.disk.clone(),
            self.event_chan.clone(),
            addr,
            socket,
        );
        self.peers.insert(addr, PeerEntry::new(cmd));

        let report_chan = self.event_chan.clone();
        task::spawn(async move {
            let mut session = session;
            let had_error = if let Err(e) = session.start().await {
                log::info!("Inbound peer {} session ended: {}", addr, e);
                true
            } else {
                false
            };
            let _ = report_chan.send(PeerEvent::Disconnected { addr, had_error });
        });
    }

    /// Tries to fill any free connection slots from the buffered-candidate
    /// queue, e.g. after a peer disconnects.
    fn drain_buffered_candidates(&mut self) {
        while self.peers.len() < self.conf.max_connected_peer_count {
            let addr = match self.buffered_candidates.pop_front() {
                Some(addr) => addr,
                None => break,
            };
            if self.peers.contains_key(&addr) {
                continue;
            }
            if let Some(failure) = self.failures.get(&addr) {
                if failure
                    .blacklisted_until
                    .map_or(false, |until| Instant::now() < until)
                {
                    continue;
                }
            }
            self.connect_peer(addr);
        }
    }

    /// Awaits the next upload-path event from any of this torrent's peer
    /// sessions. Returns `None` only if every session has dropped its
    /// sender, which can't happen while `self` (the owner of `event_chan`)
    /// is alive, so callers can treat `None` as "no more peers ever".
    pub(crate) async fn next_event(&mut self) -> Option<PeerEvent> {
        self.event_port.recv().await
    }

    pub(crate) async fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::BlockRequested { addr, block } => {
                self.pending_reads.entry(block).or_default().push_back(addr);
                if let Err(e) = self.disk.read_block(self.status.id, block) {
                    log::warn!("Failed to queue disk read for {}: {}", addr, e);
                }
            }
            PeerEvent::InterestChanged { addr, is_interested } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.is_interested = is_interested;
                }
            }
            PeerEvent::ByteCounters { addr, downloaded, uploaded } => {
                let now = Instant::now();
                if let Some(peer) = self.peers.get_mut(&addr) {
                    let down_delta = downloaded.saturating_sub(peer.last_downloaded);
                    let up_delta = uploaded.saturating_sub(peer.last_uploaded);
                    peer.download_rate.record(now, down_delta);
                    peer.upload_rate.record(now, up_delta);
                    peer.last_downloaded = downloaded;
                    peer.last_uploaded = uploaded;
                }
            }
            PeerEvent::Disconnected { addr, had_error } => {
                if let Some(peer) = self.peers.remove(&addr) {
                    self.disconnected_downloaded += peer.last_downloaded;
                    self.disconnected_uploaded += peer.last_uploaded;
                    // only count it as a connection failure if we never
                    // actually exchanged anything with it; a peer that
                    // served us data and then dropped isn't "failing"
                    let never_useful = peer.last_downloaded == 0 && peer.last_uploaded == 0;
                    if had_error && never_useful {
                        self.record_failure(addr);
                    } else {
                        self.failures.remove(&addr);
                    }
                }
                self.pending_reads.retain(|_, waiters| {
                    waiters.retain(|a| *a != addr);
                    !waiters.is_empty()
                });
                self.drain_buffered_candidates();
            }
            PeerEvent::PiecesChanged { addr, bitfield } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.pieces = Some(bitfield);
                }
            }
            PeerEvent::PieceAvailable { addr, index } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    if let Some(pieces) = &mut peer.pieces {
                        if index < pieces.len() {
                            pieces.set(index, true);
                        }
                    }
                }
            }
        }
    }

    /// Bumps an address's failure count, blacklisting it for
    /// [`BLACKLIST_DURATION`] once it crosses [`MAX_CONNECT_FAILURES`].
    fn record_failure(&mut self, addr: SocketAddr) {
        let entry = self.failures.entry(addr).or_insert(FailureEntry {
            count: 0,
            blacklisted_until: None,
        });
        entry.count += 1;
        if entry.count >= MAX_CONNECT_FAILURES {
            entry.blacklisted_until = Some(Instant::now() + BLACKLIST_DURATION);
            log::debug!(
                "Torrent {} blacklisting {} after {} failures",
                self.status.id,
                addr,
                entry.count
            );
        }
    }

    /// Routes a completed (or failed) disk read back to whichever peer is
    /// at the front of that block's waiter queue.
    pub(crate) async fn handle_disk_read(&mut self, result: Result<(BlockInfo, Vec<u8>)>) {
        match result {
            Ok((block, data)) => {
                if let Some(addr) = self.pop_waiter(&block) {
                    if let Some(peer) = self.peers.get(&addr) {
                        let _ = peer.cmd.send(peer::Command::SendBlock { block, data });
                        if self.super_seeding {
                            self.advance_superseed(addr, block.piece_index).await;
                        }
                    }
                }
            }
            Err(e) => {
                // the disk actor's read-failure alert carries no block
                // context, so we can't target a `RejectRequest` at the
                // peer that asked for it; the request will simply time out
                // on their end.
                log::warn!("Torrent {} block read failed: {}", self.status.id, e);
            }
        }
    }

    fn pop_waiter(&mut self, block: &BlockInfo) -> Option<SocketAddr> {
        let addr = self.pending_reads.get_mut(block)?.pop_front();
        if self.pending_reads.get(block).map_or(false, |q| q.is_empty()) {
            self.pending_reads.remove(block);
        }
        addr
    }

    /// Broadcasts a newly completed piece to every connected peer.
    pub(crate) async fn broadcast_have(&mut self, index: PieceIndex) {
        if self.super_seeding {
            // in superseeding mode we never broadcast; pieces are trickled
            // out one at a time per peer, see `offer_superseed_piece`
            return;
        }
        for peer in self.peers.values() {
            let _ = peer.cmd.send(peer::Command::Have(index));
        }
    }

    pub(crate) async fn set_super_seeding(&mut self, enabled: bool) {
        self.super_seeding = enabled;
        if enabled {
            let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
            for addr in addrs {
                self.offer_superseed_piece(addr).await;
            }
        }
    }

    /// Offers the peer the rarest owned piece not already offered to
    /// another peer, per BEP 16: trickling out rare pieces first gets them
    /// spread across the swarm fastest, instead of everyone converging on
    /// the same early pieces.
    async fn offer_superseed_piece(&mut self, addr: SocketAddr) {
        let offered: Vec<PieceIndex> =
            self.peers.values().filter_map(|p| p.superseed_piece).collect();
        let next_index = self
            .piece_picker
            .read()
            .await
            .rarest_owned_unoffered(&offered);
        if let (Some(index), Some(peer)) = (next_index, self.peers.get_mut(&addr)) {
            peer.superseed_piece = Some(index);
            let _ = peer.cmd.send(peer::Command::Have(index));
        }
    }

    /// Once a peer we've been superseeding to requests its offered piece,
    /// give it the next one.
    async fn advance_superseed(&mut self, addr: SocketAddr, requested_piece: PieceIndex) {
        let should_advance = self
            .peers
            .get(&addr)
            .and_then(|p| p.superseed_piece)
            .map_or(false, |offered| offered == requested_piece);
        if should_advance {
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.superseed_piece = None;
            }
            self.offer_superseed_piece(addr).await;
        }
    }

    /// Sums the last-known cumulative byte counters across currently
    /// connected peers, for the resume state file. Bytes transferred by
    /// peers that have since disconnected aren't retained.
    pub(crate) fn total_bytes(&self) -> (u64, u64) {
        self.peers.values().fold(
            (self.disconnected_downloaded, self.disconnected_uploaded),
            |(down, up), p| (down + p.last_downloaded, up + p.last_uploaded),
        )
    }

    pub(crate) fn shutdown_all(&mut self) {
        for peer in self.peers.values() {
            let _ = peer.cmd.send(peer::Command::Shutdown);
        }
    }

    /// The standard tit-for-tat choke algorithm: unchoke the top N
    /// interested peers by recent download rate (how fast they send us
    /// data), plus one extra "optimistic" unchoke every few ticks to probe
    /// peers we aren't currently rating.
    pub(crate) async fn run_choke_algorithm(&mut self) {
        self.tick_count = self.tick_count.wrapping_add(1);
        let now = Instant::now();

        let piece_picker = self.piece_picker.read().await;
        let is_seeding = piece_picker.is_complete();
        let enable_peer_priority = self
            .conf
            .sequential
            .as_ref()
            .map(|seq| seq.enable_peer_priority)
            .unwrap_or(false);
        let needed_critical = if enable_peer_priority {
            piece_picker.needed_critical_pieces()
        } else {
            Vec::new()
        };
        drop(piece_picker);

        let mut ranked: Vec<(SocketAddr, bool, f64)> = self
            .peers
            .iter_mut()
            .filter(|(_, p)| p.is_interested)
            .map(|(addr, p)| {
                // a seed has nothing to download from peers, so while
                // seeding we rank by upload rate instead (reward peers we
                // can push data to fastest).
                let rate = if is_seeding {
                    p.upload_rate.rate(now)
                } else {
                    p.download_rate.rate(now)
                };
                // peers that can serve a piece we need right now for
                // playback are ranked ahead of plain throughput
                let serves_critical = !needed_critical.is_empty()
                    && p.pieces
                        .as_ref()
                        .map(|bits| needed_critical.iter().any(|&i| i < bits.len() && bits[i]))
                        .unwrap_or(false);
                (*addr, serves_critical, rate)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.1.cmp(&a.1).then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut unchoked: std::collections::HashSet<SocketAddr> =
            ranked.iter().take(RATE_UNCHOKE_SLOT_COUNT).map(|(a, ..)| *a).collect();

        if self.tick_count % OPTIMISTIC_UNCHOKE_EVERY == 0 {
            let candidates: Vec<SocketAddr> = ranked
                .iter()
                .skip(RATE_UNCHOKE_SLOT_COUNT)
                .map(|(addr, ..)| *addr)
                .collect();
            if let Some(addr) = self.pick_optimistic_unchoke(&candidates, now) {
                unchoked.insert(addr);
            }
        }

        for (addr, peer) in self.peers.iter_mut() {
            let should_unchoke = unchoked.contains(addr);
            if should_unchoke != !peer.is_choked {
                peer.is_choked = !should_unchoke;
                let _ = peer.cmd.send(peer::Command::SetChoke(!should_unchoke));
            }
        }
    }

    /// Picks the optimistic-unchoke slot's recipient: a random newly
    /// connected peer if any qualify (§4.4, to actually learn something
    /// about peers we just met), otherwise a random candidate from the rest.
    fn pick_optimistic_unchoke(&self, candidates: &[SocketAddr], now: Instant) -> Option<SocketAddr> {
        let mut rng = rand::thread_rng();
        let newly_connected: Vec<SocketAddr> = candidates
            .iter()
            .copied()
            .filter(|addr| {
                self.peers
                    .get(addr)
                    .map(|p| now.saturating_duration_since(p.connected_at) < NEWLY_CONNECTED_AGE)
                    .unwrap_or(false)
            })
            .collect();
        if let Some(addr) = newly_connected.choose(&mut rng) {
            return Some(*addr);
        }
        candidates.choose(&mut rng).copied()
    }
}
