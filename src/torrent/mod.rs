//! The torrent task (§4.4, §5): the composition root tying together the
//! piece picker, peer sessions, the disk actor, and the swarm controller for
//! a single torrent, and the entry point through which the engine starts,
//! reconfigures, and stops it.

mod metadata;
mod peers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{select, FutureExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task;

use crate::conf::TorrentConf;
use crate::disk::{DiskHandle, PieceHashes, TorrentAlert, TorrentAlertReceiver};
use crate::error::{RejectReason, Result};
use crate::events::Event;
use crate::metainfo::Metainfo;
use crate::piece_picker::PiecePicker;
use crate::storage_info::StorageInfo;
use crate::{Bitfield, FileIndex, InfoHash, PeerId, PieceIndex, Sha256Hash, TorrentId};

pub(crate) use metadata::MetadataDownloader;
pub(crate) use peers::PeersManager;

/// Parameters supplied by a caller (the engine) to start a new torrent.
pub struct TorrentParams {
    pub metainfo: Metainfo,
    pub conf: TorrentConf,
}

/// Information about a torrent shared, read-only, with every peer session
/// and the piece picker, so they don't each need their own copy.
pub(crate) struct SharedStatus {
    pub id: TorrentId,
    pub info_hash: InfoHash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    /// The flat, torrent-wide concatenation of every file's v2 Merkle leaf
    /// hashes, in piece order. `None` for a pure v1 torrent.
    pub piece_layers: Option<Vec<Sha256Hash>>,
}

/// Builds the immutable, disk-independent parts of a new torrent: the
/// [`SharedStatus`] every session will hold an `Arc` to, and the piece
/// hashes the disk actor needs to verify completed pieces.
///
/// This is synchronous and side-effect free; it doesn't touch the disk actor
/// or the filesystem, so the engine can call it before it has an assigned
/// [`TorrentId`] slot acknowledged by the disk.
pub(crate) fn build_new_torrent(
    id: TorrentId,
    params: &TorrentParams,
) -> Result<(Arc<SharedStatus>, PieceHashes)> {
    let metainfo = &params.metainfo;
    let info_hash = metainfo.info_hash()?;
    let storage = StorageInfo::new(metainfo, params.conf.download_dir.clone());

    let piece_layers = collect_piece_layers(metainfo, &storage);

    let piece_hashes = match (metainfo.version(), &piece_layers) {
        (crate::metainfo::Version::V1, _) => {
            PieceHashes::V1(metainfo.info.pieces.clone())
        }
        (crate::metainfo::Version::V2, Some(layers)) => {
            PieceHashes::V2 { piece_layers: layers.clone() }
        }
        (crate::metainfo::Version::Hybrid, Some(layers)) => PieceHashes::Hybrid {
            v1: metainfo.info.pieces.clone(),
            piece_layers: layers.clone(),
        },
        _ => PieceHashes::V1(metainfo.info.pieces.clone()),
    };

    let status = Arc::new(SharedStatus {
        id,
        info_hash,
        client_id: params.conf.peer_id_prefix_to_peer_id(),
        storage,
        piece_layers,
    });

    Ok((status, piece_hashes))
}

/// Flattens every file's v2 Merkle leaf hashes, in file order, into one
/// torrent-wide vector indexed by the global piece index (see
/// [`crate::metainfo::Metainfo::file_piece_layer_hashes`] and the BEP 52
/// scope note in DESIGN.md). Returns `None` for a v1-only torrent.
fn collect_piece_layers(
    metainfo: &Metainfo,
    storage: &StorageInfo,
) -> Option<Vec<Sha256Hash>> {
    if metainfo.info.file_tree.is_none() {
        return None;
    }
    let files: Vec<&crate::FileInfo> = match &storage.structure {
        crate::storage_info::FsStructure::File(f) => vec![f],
        crate::storage_info::FsStructure::Archive { files } => files.iter().collect(),
    };
    let mut layers = Vec::with_capacity(storage.piece_count);
    for file in files {
        match metainfo.file_piece_layer_hashes(file) {
            Some(hashes) => layers.extend(hashes),
            None if file.len == 0 => {}
            None => {
                // a file short enough to fit in a single piece has no
                // `piece layers` entry; its root IS its leaf hash
                if let Some(root) = file.pieces_root {
                    layers.push(root);
                }
            }
        }
    }
    Some(layers)
}

impl TorrentConf {
    fn peer_id_prefix_to_peer_id(&self) -> PeerId {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(&self.peer_id_prefix);
        let suffix: [u8; 12] = rand::random();
        id[8..].copy_from_slice(&suffix);
        id
    }
}

/// Commands the engine sends to a running torrent task.
pub(crate) enum Command {
    AddPeer(SocketAddr),
    /// An inbound connection the torrent's own listener (`listen_port`) has
    /// already accepted and handed off for registration.
    AddInboundPeer(SocketAddr, tokio::net::TcpStream),
    /// Sets per-file priority: `0` deselects the file, any other value
    /// (re-)selects it. Unlisted files are left unchanged.
    ApplySelectedFiles(Vec<(FileIndex, u8)>),
    SetPlaybackPosition(PieceIndex),
    EnableSuperSeeding,
    DisableSuperSeeding,
    Shutdown,
}

pub(crate) type Sender = mpsc::UnboundedSender<Command>;
pub(crate) type Receiver = mpsc::UnboundedReceiver<Command>;

/// How often the torrent's bitfield and counters are flushed to its resume
/// state file.
const STATE_SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Binds `port` and forwards every accepted connection to the torrent task
/// as a [`Command::AddInboundPeer`] (§4.4 `listen_port`). Runs for the life
/// of the torrent; a bind failure is logged and the task simply exits,
/// leaving the torrent outbound-only.
fn spawn_inbound_listener(id: TorrentId, port: u16, cmd_chan: Sender) {
    task::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Torrent {} failed to listen on port {}: {}", id, port, e);
                return;
            }
        };
        log::info!("Torrent {} listening for peers on port {}", id, port);
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    log::info!("Torrent {} accepted inbound connection from {}", id, addr);
                    if cmd_chan.send(Command::AddInboundPeer(addr, socket)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Torrent {} accept error: {}", id, e);
                }
            }
        }
    });
}

pub(crate) struct TorrentTask {
    status: Arc<SharedStatus>,
    piece_picker: Arc<RwLock<PiecePicker>>,
    disk: DiskHandle,
    conf: TorrentConf,
    peers: PeersManager,
    events: mpsc::UnboundedSender<Event>,
    cmd_port: Receiver,
    alert_port: TorrentAlertReceiver,
    was_dense_state: bool,
    is_complete: bool,
}

impl TorrentTask {
    /// Spawns the torrent's event loop task and returns a command handle.
    ///
    /// `alert_port` is the per-torrent disk alert channel handed back by the
    /// engine once the disk actor acknowledges
    /// [`crate::disk::Command::NewTorrent`] for this torrent's id.
    /// `resume_bitfield` is the bitfield recovered from an on-disk resume
    /// state file, if the disk actor found and decoded one; it seeds the
    /// piece picker's ownership before any peer ever connects.
    pub(crate) fn spawn(
        status: Arc<SharedStatus>,
        conf: TorrentConf,
        disk: DiskHandle,
        alert_port: TorrentAlertReceiver,
        events: mpsc::UnboundedSender<Event>,
        resume_bitfield: Option<Bitfield>,
    ) -> Sender {
        let mut picker = PiecePicker::new(&status.storage, &conf);
        if let Some(bitfield) = resume_bitfield {
            if bitfield.len() == status.storage.piece_count {
                picker.set_owned(bitfield);
            } else {
                log::warn!(
                    "Torrent {} resume bitfield length mismatch, ignoring",
                    status.id
                );
            }
        }
        let piece_picker = Arc::new(RwLock::new(picker));
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();

        if let Some(port) = conf.listen_port {
            spawn_inbound_listener(status.id, port, cmd_chan.clone());
        }

        let peers = PeersManager::new(
            Arc::clone(&status),
            Arc::clone(&piece_picker),
            disk.clone(),
            conf.clone(),
        );

        let mut task = Self {
            status,
            piece_picker,
            disk,
            conf,
            peers,
            events,
            cmd_port,
            alert_port,
            was_dense_state: false,
            is_complete: false,
        };

        task::spawn(async move {
            let id = task.status.id;
            if let Err(e) = task.run().await {
                log::error!("Torrent {} event loop exited with error: {}", id, e);
                let _ = task.events.send(Event::TaskErrored(id, e.to_string()));
            }
        });

        cmd_chan
    }

    async fn run(&mut self) -> Result<()> {
        log::info!("Starting torrent {} event loop", self.status.id);
        let _ = self.events.send(Event::TaskStarted(self.status.id));

        self.is_complete = self.piece_picker.read().await.is_complete();

        let mut save_tick = tokio::time::interval(STATE_SAVE_INTERVAL);
        let mut choke_tick = tokio::time::interval(peers::CHOKE_TICK_INTERVAL);

        loop {
            select! {
                alert = self.alert_port.recv().fuse() => {
                    match alert {
                        Some(alert) => self.handle_disk_alert(alert).await?,
                        None => {
                            log::warn!("Torrent {} disk alert channel closed", self.status.id);
                            break;
                        }
                    }
                }
                event = self.peers.next_event().fuse() => {
                    if let Some(event) = event {
                        self.peers.handle_event(event).await;
                    }
                }
                _ = save_tick.tick().fuse() => {
                    self.save_state().await?;
                }
                _ = choke_tick.tick().fuse() => {
                    self.peers.run_choke_algorithm().await;
                }
                cmd = self.cmd_port.recv().fuse() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!("Shutting down torrent {}", self.status.id);
                            break;
                        }
                        Some(Command::AddPeer(addr)) => {
                            self.peers.add_peer(addr);
                        }
                        Some(Command::AddInboundPeer(addr, socket)) => {
                            self.peers.add_inbound_peer(addr, socket);
                        }
                        Some(Command::ApplySelectedFiles(selection)) => {
                            self.apply_selected_files(selection).await;
                        }
                        Some(Command::SetPlaybackPosition(index)) => {
                            self.piece_picker.write().await.set_play_position(index);
                        }
                        Some(Command::EnableSuperSeeding) => {
                            self.peers.set_super_seeding(true).await;
                        }
                        Some(Command::DisableSuperSeeding) => {
                            self.peers.set_super_seeding(false).await;
                        }
                    }
                }
            }
        }

        self.peers.shutdown_all();
        let _ = self.events.send(Event::TaskStopped(self.status.id));
        Ok(())
    }

    async fn apply_selected_files(&self, selection: Vec<(FileIndex, u8)>) {
        let files: Vec<crate::FileInfo> = match &self.status.storage.structure {
            crate::storage_info::FsStructure::File(f) => vec![f.clone()],
            crate::storage_info::FsStructure::Archive { files } => files.clone(),
        };
        let mut piece_picker = self.piece_picker.write().await;
        for (file_index, priority) in selection {
            let file = match files.get(file_index) {
                Some(f) => f,
                None => continue,
            };
            let piece_len = self.status.storage.piece_len as u64;
            let start = (file.torrent_offset / piece_len) as PieceIndex;
            let end = ((file.torrent_end_offset() + piece_len - 1) / piece_len) as PieceIndex;
            piece_picker.set_piece_range_priority(start..end, priority);
        }
    }

    async fn handle_disk_alert(&mut self, alert: TorrentAlert) -> Result<()> {
        match alert {
            TorrentAlert::BatchWrite(Ok(batch)) => {
                for block in &batch.blocks {
                    let _ = self.events.send(Event::SubPieceWriteCompleted(
                        self.status.id,
                        block.piece_index,
                    ));
                }
                let index = batch.piece_index;
                match batch.is_piece_valid {
                    Some(true) => {
                        let _ = self
                            .events
                            .send(Event::PieceAccepted(self.status.id, index));
                        self.peers.broadcast_have(index).await;
                        self.maybe_announce_completion().await;
                    }
                    Some(false) => {
                        self.piece_picker.write().await.reject_piece(index);
                        let _ = self.events.send(Event::PieceRejected(
                            self.status.id,
                            index,
                            RejectReason::HashMismatch,
                        ));
                    }
                    None => {}
                }
            }
            TorrentAlert::BatchWrite(Err(e)) => {
                let _ = self.events.send(Event::SubPieceWriteFailed(
                    self.status.id,
                    e.piece_index,
                ));
                log::warn!("Torrent {} write error: {:?}", self.status.id, e.source);
            }
            TorrentAlert::ReadBlock(result) => {
                self.peers.handle_disk_read(result).await;
            }
            TorrentAlert::StateSaved(result) => {
                if let Err(e) = result {
                    log::warn!("Torrent {} state save failed: {}", self.status.id, e);
                } else {
                    let _ = self.events.send(Event::StateFileUpdated(self.status.id));
                }
            }
        }
        Ok(())
    }

    async fn maybe_announce_completion(&mut self) {
        if self.is_complete {
            return;
        }
        if self.piece_picker.read().await.is_complete() {
            self.is_complete = true;
            let _ = self.events.send(Event::TaskCompleted(self.status.id));
        }
    }

    async fn save_state(&mut self) -> Result<()> {
        let bitfield = self.piece_picker.read().await.owned().clone();
        let (_downloaded_bytes, uploaded_bytes) = self.peers.total_bytes();
        let last_modified = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let state = crate::disk::StateFile {
            info_hash: self.status.info_hash.handshake_hash(),
            piece_count: self.status.storage.piece_count,
            piece_len: self.status.storage.piece_len,
            total_len: self.status.storage.download_len,
            uploaded_bytes,
            last_modified,
            bitfield,
        };
        let encoded = state.encode(self.was_dense_state);
        self.was_dense_state = crate::disk::StateFile::is_dense(&encoded);
        self.disk.save_state(self.status.id, encoded)
    }
}
