mod codec;
mod fastset;

use std::time::{Duration, Instant};

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        FutureExt, SinkExt, StreamExt,
    },
    std::{net::SocketAddr, sync::Arc},
    tokio::{
        net::TcpStream,
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            RwLock,
        },
    },
    tokio_util::codec::{Framed, FramedParts},
};

use crate::{
    counter::RttEstimator, disk::DiskHandle, download::PieceDownload,
    error::*, piece_picker::PiecePicker, torrent::SharedStatus, Bitfield,
    BlockInfo, PeerId, PieceIndex,
};
// re-exported so the metadata acquisition state machine (which speaks the
// same handshake + framed wire protocol over its own short-lived
// connections) can reuse the codecs instead of duplicating them.
pub(crate) use codec::*;

/// The RTO is capped so a single stalled peer never blocks a re-request for
/// more than this long.
const MAX_RTO: Duration = Duration::from_secs(60);
/// How many pieces we advertise to a peer as allowed-fast (BEP 6).
const ALLOWED_FAST_SET_SIZE: usize = 10;
/// The request queue's starting size, before any ACK has grown it.
const INITIAL_WINDOW: usize = 4;
/// The request queue's growth ceiling.
const MAX_WINDOW: usize = 64;

pub(crate) struct PeerSession {
    /// Shared information of the torrent.
    torrent: Arc<SharedStatus>,
    /// The piece picker picks the next most optimal piece to download and is
    /// shared by other entities in the same torrent.
    piece_picker: Arc<RwLock<PiecePicker>>,
    /// The entity used to save downloaded file blocks to disk.
    disk: DiskHandle,
    /// Where upload-path events (peer requests, interest changes) are
    /// reported, so the torrent's swarm controller can mediate disk reads
    /// and choke decisions across all of a torrent's sessions.
    torrent_chan: PeerEventSender,
    /// The port on which peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Session related information.
    status: Status,
    /// These are the active piece downloads in which this session is
    /// participating.
    downloads: Vec<PieceDownload>,
    /// Our pending requests sent to peer, alongside when each was (re-)sent,
    /// for RTT sampling and the congestion window's timeout logic.
    ///
    /// Note that if a request for a piece's block is in this queue, there
    /// _must_ be a corresponding entry for the piece download in `downloads`.
    outgoing_requests: Vec<(BlockInfo, Instant)>,
    /// Piece indices the peer has told us (via `AllowedFast`) we may request
    /// even while choked (BEP 6).
    peer_allowed_fast: Vec<PieceIndex>,
    /// Smoothed round-trip time, driving the per-peer request timeout.
    rtt: RttEstimator,
    /// Information about a peer that is set after a successful handshake.
    peer_info: Option<PeerInfo>,
    /// `None` for an outbound session, which dials `addr` itself in
    /// [`Self::start`]; `Some` for an inbound session that was accepted by a
    /// listener and already has a live socket to hand off.
    inbound_socket: Option<TcpStream>,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        torrent_chan: PeerEventSender,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        Self::new(torrent, piece_picker, disk, torrent_chan, addr, None)
    }

    /// Creates a new session for a connection a listener has already
    /// accepted from `addr`. The handshake is driven in the opposite order
    /// from [`Self::outbound`]: we wait for the peer's handshake first, then
    /// reply, since the peer initiated the connection.
    pub fn inbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        torrent_chan: PeerEventSender,
        addr: SocketAddr,
        socket: TcpStream,
    ) -> (Self, Sender) {
        Self::new(torrent, piece_picker, disk, torrent_chan, addr, Some(socket))
    }

    fn new(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        torrent_chan: PeerEventSender,
        addr: SocketAddr,
        inbound_socket: Option<TcpStream>,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                piece_picker,
                disk,
                torrent_chan,
                cmd_port: cmd_port.fuse(),
                addr,
                status: Status::default(),
                downloads: Vec::new(),
                outgoing_requests: Vec::new(),
                peer_allowed_fast: Vec::new(),
                rtt: RttEstimator::new(MAX_RTO),
                peer_info: None,
                inbound_socket,
            },
            cmd_chan,
        )
    }

    /// Starts the peer session and returns if the connection is closed or an
    /// error occurs.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting peer {} session", self.addr);

        let is_outbound = self.inbound_socket.is_none();
        let socket = match self.inbound_socket.take() {
            Some(socket) => socket,
            None => {
                log::info!("Connecting to peer {}", self.addr);
                self.status.state = State::Connecting;
                let socket = TcpStream::connect(self.addr).await?;
                log::info!("Connected to peer {}", self.addr);
                socket
            }
        };

        let mut socket = Framed::new(socket, HandshakeCodec);

        self.status.state = State::Handshaking;
        let handshake = Handshake::new(
            self.torrent.info_hash.handshake_hash(),
            self.torrent.client_id,
            true,
            self.torrent.info_hash.supports_v2(),
        );

        // an outbound connection sends the first handshake; an inbound one
        // waits for the peer's handshake before replying
        if is_outbound {
            log::info!("Sending handshake to peer {}", self.addr);
            socket.send(handshake.clone()).await?;
        }

        // receive peer's handshake
        log::info!("Waiting for peer {} handshake", self.addr);
        if let Some(peer_handshake) = socket.next().await {
            let peer_handshake = peer_handshake?;
            log::info!("Received handshake from peer {}", self.addr);
            log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
            // codec should only return handshake if the protocol string in it
            // is valid
            debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

            // verify that the advertised torrent info hash is the same as ours
            if peer_handshake.info_hash != handshake.info_hash {
                log::info!("Peer {} handshake invalid info hash", self.addr);
                return Err(Error::InvalidPeerInfoHash);
            }

            if !is_outbound {
                log::info!("Sending handshake to peer {}", self.addr);
                socket.send(handshake.clone()).await?;
            }

            self.status.supports_fast_extension =
                handshake.supports_fast_extension()
                    && peer_handshake.supports_fast_extension();
            self.status.supports_v2 =
                handshake.supports_v2() && peer_handshake.supports_v2();

            // set basic peer information
            self.peer_info = Some(PeerInfo {
                peer_id: peer_handshake.peer_id,
                pieces: None,
            });

            // now that we have the handshake, we need to switch to the peer
            // message codec and save the socket in self (note that we need to
            // keep the buffer from the original codec as it may contain bytes
            // of any potential message the peer may have sent after the
            // handshake)
            let old_parts = socket.into_parts();
            let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
            new_parts.read_buf = old_parts.read_buf;
            new_parts.write_buf = old_parts.write_buf;
            let mut socket = Framed::from_parts(new_parts);

            // enter the piece availability exchange state until peer sends a
            // bitfield, HaveAll, HaveNone, or anything else (in which case we
            // assume it has no pieces)
            self.status.state = State::AvailabilityExchange;
            log::info!(
                "Peer {} session state: {:?}",
                self.addr,
                self.status.state
            );

            // announce our own piece availability: a plain bitfield is always
            // a valid choice and works whether or not the peer negotiated the
            // fast extension
            let owned = self.piece_picker.read().await.owned().clone();
            if owned.any() {
                socket.send(Message::Bitfield(owned.clone())).await?;
            }

            // advertise an allowed-fast set of pieces we own, so the peer
            // may request them from us even while we keep it choked
            if self.status.supports_fast_extension {
                if let Some(v1_hash) = self.torrent.info_hash.v1() {
                    let allowed = fastset::generate(
                        self.addr.ip(),
                        &v1_hash,
                        self.torrent.storage.piece_count,
                        ALLOWED_FAST_SET_SIZE,
                    );
                    for piece_index in allowed {
                        if owned[piece_index] {
                            socket
                                .send(Message::AllowedFast {
                                    piece_index: piece_index as u32,
                                })
                                .await?;
                        }
                    }
                }
            }

            self.run(socket).await?;
        }

        Ok(())
    }

    /// Runs the session after connection to peer is established.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        let mut timeout_tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    log::debug!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        self.addr,
                    );

                    if self.status.state == State::AvailabilityExchange {
                        self.handle_availability_msg(&mut sink, msg).await?;
                        self.status.state = State::Connected;
                        log::info!(
                            "Peer {} session state: {:?}",
                            self.addr,
                            self.status.state
                        );
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                _ = timeout_tick.tick().fuse() => {
                    self.check_request_timeouts(&mut sink).await?;
                    let _ = self.torrent_chan.send(PeerEvent::ByteCounters {
                        addr: self.addr,
                        downloaded: self.status.downloaded_block_bytes_count,
                        uploaded: self.status.uploaded_block_bytes_count,
                    });
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("Shutting down peer {} session", self.addr);
                            break;
                        }
                        Command::SetChoke(choke) => {
                            if choke != self.status.is_peer_choked {
                                self.status.is_peer_choked = choke;
                                let msg = if choke { Message::Choke } else { Message::Unchoke };
                                sink.send(msg).await?;
                            }
                        }
                        Command::SendBlock { block, data } => {
                            self.status.uploaded_block_bytes_count += data.len() as u64;
                            sink.send(Message::Block {
                                piece_index: block.piece_index,
                                offset: block.offset,
                                data,
                            }).await?;
                        }
                        Command::Have(piece_index) => {
                            sink.send(Message::Have {
                                piece_index: piece_index as u32,
                            }).await?;
                        }
                        Command::RejectRequest(block) => {
                            if self.status.supports_fast_extension {
                                sink.send(Message::RejectRequest(block)).await?;
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Handles the single message expected in the `AvailabilityExchange`
    /// state: a `Bitfield`, or, if the fast extension was negotiated,
    /// `HaveAll`/`HaveNone`. Any other message means the peer chose to skip
    /// announcing its availability, in which case we assume it has nothing
    /// and fall through to the normal message handler.
    async fn handle_availability_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);

        let bitfield = match msg {
            Message::Bitfield(mut bitfield) => {
                // the wire bitfield may be padded to a byte boundary
                bitfield.resize(self.torrent.storage.piece_count, false);
                bitfield
            }
            Message::HaveAll if self.status.supports_fast_extension => {
                Bitfield::repeat(true, self.torrent.storage.piece_count)
            }
            Message::HaveNone if self.status.supports_fast_extension => {
                Bitfield::repeat(false, self.torrent.storage.piece_count)
            }
            Message::HaveAll | Message::HaveNone => {
                return Err(Error::ProtocolViolation(
                    "HaveAll/HaveNone without fast extension",
                ));
            }
            other => {
                log::info!(
                    "Peer {} skipped availability announcement",
                    self.addr
                );
                // no availability to register; handle the message normally
                return self.handle_msg(sink, other).await;
            }
        };

        log::info!("Handling peer {} availability message", self.addr);
        log::trace!("Bitfield: {:?}", bitfield);

        let mut piece_picker = self.piece_picker.write().await;
        self.status.is_interested =
            piece_picker.register_availability(&bitfield)?;
        drop(piece_picker);

        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = Some(bitfield.clone());
        }
        let _ = self.torrent_chan.send(PeerEvent::PiecesChanged {
            addr: self.addr,
            bitfield,
        });

        if self.status.is_interested {
            log::info!("Interested in peer {}", self.addr);
            sink.send(Message::Interested).await?;
            self.status.best_request_queue_len = Some(INITIAL_WINDOW);
        }

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) | Message::HaveAll | Message::HaveNone => {
                log::info!(
                    "Peer {} sent bitfield-like message not after handshake",
                    self.addr
                );
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {
                log::info!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    self.drop_requests_on_choke();
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                    let _ = self.torrent_chan.send(PeerEvent::InterestChanged {
                        addr: self.addr,
                        is_interested: true,
                    });
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                    let _ = self.torrent_chan.send(PeerEvent::InterestChanged {
                        addr: self.addr,
                        is_interested: false,
                    });
                }
            }
            Message::Have { piece_index } => {
                let piece_index = piece_index as PieceIndex;
                let became_interesting =
                    self.piece_picker.write().await.register_have(piece_index);
                if let Some(peer_info) = &mut self.peer_info {
                    if let Some(pieces) = &mut peer_info.pieces {
                        if piece_index < pieces.len() {
                            pieces.set(piece_index, true);
                        }
                    }
                }
                let _ = self.torrent_chan.send(PeerEvent::PieceAvailable {
                    addr: self.addr,
                    index: piece_index,
                });
                if became_interesting && !self.status.is_interested {
                    self.status.is_interested = true;
                    sink.send(Message::Interested).await?;
                }
            }
            Message::AllowedFast { piece_index } => {
                let piece_index = piece_index as PieceIndex;
                log::debug!(
                    "Peer {} allows fast piece {}",
                    self.addr,
                    piece_index
                );
                if !self.peer_allowed_fast.contains(&piece_index) {
                    self.peer_allowed_fast.push(piece_index);
                }
                if self.status.is_choked {
                    self.make_requests(sink).await?;
                }
            }
            Message::RejectRequest(block) => {
                log::debug!(
                    "Peer {} rejected request {:?}",
                    self.addr,
                    block
                );
                self.forget_request(block);
            }
            Message::Block { piece_index, offset, data } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block_info, data).await?;
                self.make_requests(sink).await?;
            }
            Message::HashRequest(request) => {
                self.handle_hash_request(sink, request).await?;
            }
            Message::Hashes { .. } | Message::HashReject(_) => {
                // we don't yet issue our own HashRequests, so unsolicited
                // responses are simply ignored
                log::trace!("Peer {} sent a v2 hash message", self.addr);
            }
            Message::Request(block) => {
                if self.status.is_peer_choked {
                    log::debug!(
                        "Ignoring request {:?} from choked peer {}",
                        block,
                        self.addr
                    );
                } else {
                    let _ = self.torrent_chan.send(PeerEvent::BlockRequested {
                        addr: self.addr,
                        block,
                    });
                }
            }
            Message::Cancel(_) | Message::Port(_) | Message::SuggestPiece { .. } => {
                // cancellation of a not-yet-served request, DHT port
                // announcement, and superseeding hints are not acted upon by
                // this minimal upload path
                log::trace!(
                    "Peer {} sent upload-path message {:?}",
                    self.addr,
                    msg.id()
                );
            }
            Message::Extended { ext_id, payload } => {
                log::trace!(
                    "Peer {} sent extended message (id {}, {} bytes)",
                    self.addr,
                    ext_id,
                    payload.len()
                );
            }
        }

        Ok(())
    }

    /// Answers a peer's request for a piece layer's hashes (BEP 52), if we
    /// have them; otherwise rejects.
    async fn handle_hash_request(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        request: HashRequest,
    ) -> Result<()> {
        let hashes = self.torrent.piece_layers.as_ref().and_then(|layers| {
            let start = request.index as usize;
            let end = start.checked_add(request.length as usize)?;
            layers.get(start..end).map(|s| s.to_vec())
        });
        match hashes {
            Some(hashes) => {
                sink.send(Message::Hashes { request, hashes }).await?;
            }
            None => {
                sink.send(Message::HashReject(request)).await?;
            }
        }
        Ok(())
    }

    /// Drops outstanding requests when the peer chokes us, keeping (per the
    /// fast extension) any requests for pieces it has told us are allowed.
    fn drop_requests_on_choke(&mut self) {
        if self.status.supports_fast_extension {
            let allowed = self.peer_allowed_fast.clone();
            let mut to_revert = Vec::new();
            self.outgoing_requests.retain(|(b, _)| {
                if allowed.contains(&b.piece_index) {
                    true
                } else {
                    to_revert.push(*b);
                    false
                }
            });
            for b in to_revert {
                self.revert_block(b);
            }
        } else {
            let requests: Vec<BlockInfo> = self
                .outgoing_requests
                .drain(..)
                .map(|(b, _)| b)
                .collect();
            for b in requests {
                self.revert_block(b);
            }
        }
    }

    /// Removes `block` from the outgoing request queue (if present) and
    /// reverts its `PieceDownload` entry back to missing.
    fn forget_request(&mut self, block: BlockInfo) {
        self.outgoing_requests.retain(|(b, _)| *b != block);
        self.revert_block(block);
    }

    fn revert_block(&mut self, block: BlockInfo) {
        if let Some(download) = self
            .downloads
            .iter_mut()
            .find(|d| d.piece_index() == block.piece_index)
        {
            download.time_out_block(block);
        }
    }

    /// Checks outstanding requests against the current RTO and re-requests
    /// (after backing off the estimator) any that have timed out.
    async fn check_request_timeouts(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        let now = Instant::now();
        let rto = self.rtt.rto();
        let mut timed_out = Vec::new();
        for download in self.downloads.iter() {
            timed_out.extend(download.timed_out_blocks(rto, now));
        }
        if timed_out.is_empty() {
            return Ok(());
        }
        log::debug!(
            "Peer {} has {} timed out request(s), RTO {:?}",
            self.addr,
            timed_out.len(),
            rto
        );
        self.rtt.backoff();
        let window = self.status.best_request_queue_len.unwrap_or(INITIAL_WINDOW);
        self.status.best_request_queue_len = Some((window / 2).max(1));
        for block in timed_out {
            self.outgoing_requests.retain(|(b, _)| *b != block);
            self.revert_block(block);
        }
        self.make_requests(sink).await
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests: continuing in-progress pieces, then starting new ones, and
    /// finally (in endgame) duplicating still-outstanding blocks.
    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        log::trace!("Making requests to peer {}", self.addr);

        let queue_len = self.status.best_request_queue_len.unwrap_or_default();
        // a choked peer may only request pieces on its allowed-fast list
        let budget = |outgoing: usize| queue_len.saturating_sub(outgoing);
        if budget(self.outgoing_requests.len()) == 0 {
            return Ok(());
        }
        if self.status.is_choked && !self.status.supports_fast_extension {
            return Ok(());
        }

        let mut blocks = Vec::new();
        let allowed_fast = self.peer_allowed_fast.clone();
        let is_choked = self.status.is_choked;

        for download in self.downloads.iter_mut() {
            if is_choked && !allowed_fast.contains(&download.piece_index()) {
                continue;
            }
            let to_request_count =
                budget(self.outgoing_requests.len() + blocks.len());
            if to_request_count == 0 {
                break;
            }
            download.pick_blocks(to_request_count, &mut blocks);
        }

        if !is_choked {
            loop {
                let request_queue_len =
                    budget(self.outgoing_requests.len() + blocks.len());
                if request_queue_len == 0 {
                    break;
                }

                log::debug!("Session {} starting new piece download", self.addr);

                let mut piece_picker = self.piece_picker.write().await;
                if let Some(index) = piece_picker.pick_piece() {
                    drop(piece_picker);
                    log::info!("Session {} picked piece {}", self.addr, index);

                    let mut download = PieceDownload::new(
                        index,
                        self.torrent.storage.piece_len(index)?,
                    );
                    download.pick_blocks(request_queue_len, &mut blocks);
                    self.downloads.push(download);
                } else {
                    log::debug!(
                        "Could not pick more pieces from peer {}",
                        self.addr
                    );
                    break;
                }
            }
        }

        // endgame: duplicate still-outstanding blocks of our in-progress
        // pieces to other peers, to finish the torrent despite slow/dead
        // connections holding the last few pieces
        if self.piece_picker.read().await.is_endgame() {
            let now = Instant::now();
            let min_age = self.rtt.rto() / 2;
            for download in self.downloads.iter() {
                let remaining =
                    budget(self.outgoing_requests.len() + blocks.len());
                if remaining == 0 {
                    break;
                }
                download.pick_duplicate_blocks(remaining, min_age, now, &mut blocks);
            }
        }

        let now = Instant::now();
        for block in blocks.iter() {
            self.outgoing_requests.push((*block, now));
        }
        for block in blocks.iter() {
            sink.send(Message::Request(*block)).await?;
        }

        Ok(())
    }

    /// Verifies block validity, registers the download (and finishes a piece
    /// download if this was the last missing block in piece) and updates
    /// statistics about the download.
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::info!("Received block from peer {}: {:?}", self.addr, block_info);

        let request_pos = self
            .outgoing_requests
            .iter()
            .position(|(b, _)| *b == block_info);
        let requested_at = match request_pos {
            Some(pos) => {
                let (_, at) = self.outgoing_requests.remove(pos);
                Some(at)
            }
            None => {
                log::warn!(
                    "Peer {} sent not requested block: {:?}",
                    self.addr,
                    block_info,
                );
                // In endgame this block may have already been served to us
                // by a different peer for the same piece; harmless to keep.
                None
            }
        };
        if let Some(at) = requested_at {
            self.rtt.sample(Instant::now().saturating_duration_since(at));
            let window = self.status.best_request_queue_len.unwrap_or(INITIAL_WINDOW);
            self.status.best_request_queue_len = Some((window + 1).min(MAX_WINDOW));
        }

        let download_pos = self
            .downloads
            .iter()
            .position(|d| d.piece_index() == block_info.piece_index);
        let download_pos = match download_pos {
            Some(pos) => pos,
            None => return Ok(()),
        };
        let download = &mut self.downloads[download_pos];
        download.received_block(block_info);

        // a duplicate (endgame) request for an already-received block from
        // another peer may arrive again; drop any of our own still
        // outstanding requests for the same block
        self.outgoing_requests
            .retain(|(b, _)| b.index_in_piece() != block_info.index_in_piece()
                || b.piece_index != block_info.piece_index);

        let missing_blocks_count = download.count_missing_blocks();
        if missing_blocks_count == 0 {
            log::info!(
                "Finished piece {} via peer {}",
                block_info.piece_index,
                self.addr
            );
            self.piece_picker
                .write()
                .await
                .received_piece(block_info.piece_index);
            self.downloads.remove(download_pos);
        } else {
            self.piece_picker
                .write()
                .await
                .mark_partial(block_info.piece_index);
        }

        self.disk.write_block(self.torrent.id, block_info, data)?;

        self.status.downloaded_block_bytes_count += block_info.len as u64;

        Ok(())
    }
}

/// The channel on which torrent can send a command to the peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands peer session can receive.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
    /// Choke or unchoke the peer, per the swarm controller's decision.
    SetChoke(bool),
    /// Sends a block read off disk in response to a previously reported
    /// [`PeerEvent::BlockRequested`].
    SendBlock { block: BlockInfo, data: Vec<u8> },
    /// Rejects a previously reported request, e.g. because disk read failed
    /// or the piece is no longer available.
    RejectRequest(BlockInfo),
    /// Announces a newly completed piece to the peer.
    Have(PieceIndex),
}

/// Upload-path events a peer session reports to the torrent's swarm
/// controller, which alone has the cross-session view needed to make
/// choke/unchoke decisions and to mediate disk reads.
pub(crate) enum PeerEvent {
    /// The peer requested a block we have and haven't choked it from.
    BlockRequested { addr: SocketAddr, block: BlockInfo },
    /// The peer's interest in us changed.
    InterestChanged { addr: SocketAddr, is_interested: bool },
    /// Periodic (roughly once a second) cumulative byte counters, used by
    /// the choke scheduler to estimate each peer's recent transfer rate.
    ByteCounters { addr: SocketAddr, downloaded: u64, uploaded: u64 },
    /// The session's connection ended (error or peer disconnect), so the
    /// swarm controller should drop its bookkeeping and command sender.
    Disconnected { addr: SocketAddr },
    /// The peer announced its full piece availability (post-handshake
    /// bitfield, `HaveAll`, or `HaveNone`), for the choke algorithm's
    /// `enable_peer_priority` ranking.
    PiecesChanged { addr: SocketAddr, bitfield: Bitfield },
    /// The peer announced a single newly-available piece (`Have`).
    PieceAvailable { addr: SocketAddr, index: PieceIndex },
}

pub(crate) type PeerEventSender = UnboundedSender<PeerEvent>;
pub(crate) type PeerEventReceiver = UnboundedReceiver<PeerEvent>;

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them
    /// (except those on its allowed-fast list, if negotiated).
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we have.
    is_peer_interested: bool,
    /// Whether both sides negotiated the Fast Extension (BEP 6).
    supports_fast_extension: bool,
    /// Whether both sides negotiated v2/hybrid support.
    supports_v2: bool,
    /// The request queue size, which is the number of block requests we keep
    /// outstanding to fully saturate the link.
    ///
    /// Only set once we become interested. Grows by one on every acked
    /// block up to [`MAX_WINDOW`], and is halved (floor 1) whenever a
    /// request times out against the current RTO.
    best_request_queue_len: Option<usize>,
    /// The total number of bytes downloaded (protocol chatter and downloaded
    /// files).
    downloaded_bytes_count: u64,
    /// The number of piece/block bytes downloaded.
    downloaded_block_bytes_count: u64,
    /// The number of piece/block bytes uploaded.
    uploaded_block_bytes_count: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            supports_fast_extension: false,
            supports_v2: false,
            best_request_queue_len: None,
            downloaded_bytes_count: 0,
            downloaded_block_bytes_count: 0,
            uploaded_block_bytes_count: 0,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected or it had been connected
    /// before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// Verifies that the bitfield/HaveAll/HaveNone exchange occurs right
    /// after the handshake and not later. Any subsequent such message is
    /// rejected and the connection is dropped, as per the standard.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the handshake and the availability announcement, may be
    /// exchanged.
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    peer_id: PeerId,
    /// All pieces peer has, updated when it announces to us a new piece.
    pieces: Option<Bitfield>,
}
