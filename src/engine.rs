//! The multi-torrent composition root and the crate's public entry point
//! (§5, §6): owns the single disk actor shared by every torrent, routes its
//! per-allocation alerts to the right [`crate::torrent::TorrentTask`], and
//! exposes the external inputs a caller (a CLI, a GUI, a tracker/DHT client
//! living outside this crate) drives the engine with.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task;

use crate::conf::Conf;
use crate::disk::{self, DiskHandle, NewTorrentError, TorrentAlertReceiver};
use crate::Bitfield;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::magnet::MagnetLink;
use crate::torrent::{self, MetadataDownloader, TorrentParams};
use crate::{FileIndex, PieceIndex, TorrentId};

/// Where a candidate peer address came from. This crate doesn't implement a
/// tracker client, DHT, or LSD announcer itself (those are external
/// collaborators per the scope notes in DESIGN.md); the tag exists so a
/// caller that does run one can still hand addresses to the engine through
/// a single, uniform `add_peer` entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Tracker,
    Dht,
    Lsd,
    Manual,
    Incoming,
    PeerExchange,
}

struct PendingAllocation {
    id: TorrentId,
    reply: oneshot::Sender<
        std::result::Result<(TorrentAlertReceiver, Option<Bitfield>), NewTorrentError>,
    >,
}

/// A running torrent's command handle, plus whatever the engine needs to
/// answer queries about it without asking the torrent task directly.
struct TorrentEntry {
    cmd: torrent::Sender,
}

/// Owns the disk actor and every running torrent task. Cloning an `Engine`
/// is cheap and shares the same underlying state (all fields are handles).
#[derive(Clone)]
pub struct Engine {
    conf: Conf,
    disk: DiskHandle,
    events: mpsc::UnboundedSender<Event>,
    torrents: Arc<RwLock<HashMap<TorrentId, TorrentEntry>>>,
    /// Serializes disk-allocation requests so that a `NewTorrentError`
    /// (which carries no torrent id) can be unambiguously attributed to the
    /// oldest outstanding request. `disk::Alert::TorrentAllocation`'s error
    /// variant doesn't carry the id it failed for; only one allocation is
    /// ever in flight at a time, which keeps this trivially correct.
    alloc_lock: Arc<Mutex<()>>,
    pending_alloc: Arc<Mutex<VecDeque<PendingAllocation>>>,
}

impl Engine {
    /// Spawns the disk actor and the alert-routing task, and returns a
    /// handle to the running engine. `events` receives every event emitted
    /// by every torrent this engine manages (§6).
    pub fn new(conf: Conf, events: mpsc::UnboundedSender<Event>) -> Result<Self> {
        let (disk, alert_port) = DiskHandle::spawn()?;
        let pending_alloc = Arc::new(Mutex::new(VecDeque::new()));

        task::spawn(route_disk_alerts(alert_port, Arc::clone(&pending_alloc)));

        Ok(Self {
            conf,
            disk,
            events,
            torrents: Arc::new(RwLock::new(HashMap::new())),
            alloc_lock: Arc::new(Mutex::new(())),
            pending_alloc,
        })
    }

    /// Starts a new torrent from an already-parsed metainfo. Returns the
    /// assigned torrent id once the torrent task is running.
    pub async fn add_torrent(&self, params: TorrentParams) -> Result<TorrentId> {
        let id = rand::random();
        self.allocate_and_spawn(id, params).await?;
        Ok(id)
    }

    /// Starts a new torrent from a magnet link: first runs
    /// [`MetadataDownloader`] against the link's peer hints to obtain a
    /// full [`crate::metainfo::Metainfo`] (§4.5), then proceeds exactly as
    /// [`Self::add_torrent`], and finally connects to every peer hint for
    /// real (the metadata-only connections are short-lived and don't carry
    /// over).
    pub async fn add_magnet(&self, magnet: MagnetLink, torrent_conf: crate::conf::TorrentConf) -> Result<TorrentId> {
        let id = rand::random();
        let metainfo = MetadataDownloader::fetch(
            id,
            &magnet,
            self.conf.engine.client_id,
            &magnet.peer_hints,
            &self.events,
        )
        .await?;

        let params = TorrentParams { metainfo, conf: torrent_conf };
        self.allocate_and_spawn(id, params).await?;

        for &addr in &magnet.peer_hints {
            self.add_peer(id, addr, PeerSource::Manual).await?;
        }

        Ok(id)
    }

    async fn allocate_and_spawn(&self, id: TorrentId, params: TorrentParams) -> Result<()> {
        let (status, piece_hashes) = torrent::build_new_torrent(id, &params)?;

        let (alert_port, resume_bitfield) = {
            // held across the allocation round trip: `NewTorrentError`
            // carries no id, so only one allocation may be in flight
            let _guard = self.alloc_lock.lock().await;
            let (reply, recv) = oneshot::channel();
            self.pending_alloc.lock().await.push_back(PendingAllocation { id, reply });
            let info_hash_hex = status.info_hash.primary_hex();
            // disabling fast resumption means we don't trust a leftover
            // resume bitfield without re-hashing it first, same as
            // `resume_validation` on its own.
            let resume_validation = params.conf.resume_validation
                || params
                    .conf
                    .sequential
                    .as_ref()
                    .map(|seq| !seq.enable_fast_resumption)
                    .unwrap_or(false);
            self.disk.allocate_new_torrent(
                id,
                status.storage.clone(),
                piece_hashes,
                info_hash_hex,
                resume_validation,
            )?;
            recv.await
                .map_err(|_| Error::ProtocolViolation("disk actor dropped allocation reply"))?
                .map_err(new_torrent_error_to_error)?
        };

        let cmd = torrent::TorrentTask::spawn(
            status,
            params.conf,
            self.disk.clone(),
            alert_port,
            self.events.clone(),
            resume_bitfield,
        );
        self.torrents.write().await.insert(id, TorrentEntry { cmd });
        Ok(())
    }

    /// Feeds a candidate peer address to a torrent. Idempotent on address;
    /// duplicates are ignored by the swarm controller (§4.4).
    pub async fn add_peer(&self, id: TorrentId, addr: SocketAddr, _source: PeerSource) -> Result<()> {
        self.send_command(id, torrent::Command::AddPeer(addr)).await
    }

    /// Sets per-file download priority; `0` deselects a file.
    pub async fn apply_selected_files(
        &self,
        id: TorrentId,
        selection: Vec<(FileIndex, u8)>,
    ) -> Result<()> {
        self.send_command(id, torrent::Command::ApplySelectedFiles(selection)).await
    }

    /// Moves the sequential/streaming selector's playback position.
    pub async fn set_playback_position(&self, id: TorrentId, piece_index: PieceIndex) -> Result<()> {
        self.send_command(id, torrent::Command::SetPlaybackPosition(piece_index)).await
    }

    pub async fn enable_superseeding(&self, id: TorrentId) -> Result<()> {
        self.send_command(id, torrent::Command::EnableSuperSeeding).await
    }

    pub async fn disable_superseeding(&self, id: TorrentId) -> Result<()> {
        self.send_command(id, torrent::Command::DisableSuperSeeding).await
    }

    /// Initiates a torrent's graceful shutdown (§5): no new peer
    /// connections, in-flight sub-pieces allowed to finish, state flushed,
    /// every peer session closed. The task emits `TaskStopped` once done.
    pub async fn stop_torrent(&self, id: TorrentId) -> Result<()> {
        self.send_command(id, torrent::Command::Shutdown).await
    }

    /// Releases a stopped torrent's bookkeeping (file handles are closed;
    /// the files themselves are left on disk). Idempotent: disposing an
    /// unknown or already-disposed id is a no-op.
    pub async fn dispose_torrent(&self, id: TorrentId) -> Result<()> {
        self.torrents.write().await.remove(&id);
        self.disk.remove_torrent(id)
    }

    async fn send_command(&self, id: TorrentId, cmd: torrent::Command) -> Result<()> {
        let torrents = self.torrents.read().await;
        let entry = torrents.get(&id).ok_or(Error::InvalidTorrentId)?;
        entry
            .cmd
            .send(cmd)
            .map_err(|_| Error::ProtocolViolation("torrent task has already shut down"))
    }
}

fn new_torrent_error_to_error(e: NewTorrentError) -> Error {
    match e {
        NewTorrentError::AlreadyExists => {
            Error::InvalidConfig("torrent id already allocated by the disk actor")
        }
        NewTorrentError::Io(io_err) => Error::Io(io_err),
    }
}

/// Forwards disk allocation results to whichever `add_torrent`/`add_magnet`
/// call is waiting on them, in FIFO order.
async fn route_disk_alerts(
    mut alert_port: disk::AlertReceiver,
    pending_alloc: Arc<Mutex<VecDeque<PendingAllocation>>>,
) {
    while let Some(disk::Alert::TorrentAllocation(result)) = alert_port.recv().await {
        let mut queue = pending_alloc.lock().await;
        let pending = match queue.pop_front() {
            Some(p) => p,
            None => {
                log::warn!("Disk allocation alert with no pending request");
                continue;
            }
        };
        drop(queue);
        let reply = match result {
            Ok(alloc) => {
                debug_assert_eq!(alloc.id, pending.id);
                Ok((alloc.alert_port, alloc.resume_bitfield))
            }
            Err(e) => Err(e),
        };
        let _ = pending.reply.send(reply);
    }
}
