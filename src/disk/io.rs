use {
    nix::sys::uio::pwritev,
    sha1::{Digest as Sha1Digest, Sha1},
    std::{
        collections::{BTreeMap, HashMap},
        fs::{self, File, OpenOptions},
        ops::Range,
        os::unix::io::AsRawFd,
        sync::{Arc, Mutex},
    },
    tokio::{
        sync::{mpsc, RwLock},
        task,
    },
};

use {
    super::{
        verify, Alert, AlertSender, BatchWrite, Command, CommandReceiver,
        CommandSender, NewTorrentError, PieceHashes, StateFile, TorrentAlert,
        TorrentAlertReceiver, TorrentAlertSender, TorrentAllocation,
    },
    crate::{
        block_count,
        error::{Error, Result, WriteError},
        iovecs::{IoVec, IoVecs},
        storage_info::{FsStructure, StorageInfo},
        BlockInfo, Bitfield, FileIndex, FileInfo, PieceIndex, Sha1Hash, TorrentId,
    },
};

/// The entity responsible for saving downloaded file blocks to disk and
/// verifying whether downloaded pieces are valid.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap, which
    /// includes various metadata about torrent and the torrent specific alert
    /// channel.
    torrents: HashMap<TorrentId, RwLock<Torrent>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an alert
    /// receiver.
    pub(super) fn new() -> Result<(Self, CommandSender, super::AlertReceiver)> {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            log::debug!("Disk received command");
            match cmd {
                Command::NewTorrent { id, info, piece_hashes, info_hash_hex, resume_validation } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        self.alert_chan.send(Alert::TorrentAllocation(Err(
                            NewTorrentError::AlreadyExists,
                        )))?;
                        continue;
                    }

                    // NOTE: do _NOT_ return on failure, we don't want to kill
                    // the disk task due to potential disk IO errors: log it
                    // and notify engine of it.
                    let torrent_res =
                        Torrent::new(info, piece_hashes, info_hash_hex, resume_validation);
                    match torrent_res {
                        Ok((torrent, alert_port, resume_bitfield)) => {
                            log::info!("Torrent {} successfully allocated", id);
                            self.torrents.insert(id, RwLock::new(torrent));
                            self.alert_chan.send(Alert::TorrentAllocation(
                                Ok(TorrentAllocation { id, alert_port, resume_bitfield }),
                            ))?;
                        }
                        Err(e) => {
                            log::warn!("Torrent {} allocation failure: {}", id, e);
                            self.alert_chan
                                .send(Alert::TorrentAllocation(Err(e)))?;
                        }
                    }
                }
                Command::WriteBlock { id, info, data } => {
                    self.write_block(id, info, data).await?;
                }
                Command::ReadBlock { id, info } => {
                    self.read_block(id, info).await?;
                }
                Command::SaveState { id, data } => {
                    self.save_state(id, data).await?;
                }
                Command::RemoveTorrent { id } => {
                    self.torrents.remove(&id);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn write_block(&self, id: TorrentId, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        log::trace!("Saving torrent {} block {:?} to disk", id, info);
        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })?;
        torrent.write().await.write_block(info, data).await
    }

    async fn read_block(&self, id: TorrentId, info: BlockInfo) -> Result<()> {
        let torrent = self.torrents.get(&id).ok_or(Error::InvalidTorrentId)?;
        torrent.read().await.read_block(info).await
    }

    async fn save_state(&self, id: TorrentId, data: Vec<u8>) -> Result<()> {
        let torrent = self.torrents.get(&id).ok_or(Error::InvalidTorrentId)?;
        let torrent = torrent.read().await;
        let path = torrent.state_path.clone();
        let alert_chan = torrent.alert_chan.clone();
        task::spawn_blocking(move || {
            let result = fs::write(&path, &data).map_err(Error::from);
            let _ = alert_chan.send(TorrentAlert::StateSaved(result));
        })
        .await
        .expect("disk IO state save task panicked");
        Ok(())
    }
}

/// Torrent information related to disk IO.
struct Torrent {
    info: StorageInfo,
    alert_chan: TorrentAlertSender,
    pieces: HashMap<PieceIndex, Piece>,
    files: Arc<Vec<Mutex<TorrentFile>>>,
    piece_hashes: PieceHashes,
    /// Sibling path of `info.download_dir` carrying the resume state file.
    state_path: std::path::PathBuf,
    stats: Stats,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles. Also opens and decodes any resume state file already on
    /// disk from a previous run, returning its bitfield (if any) so the
    /// caller can seed the piece picker with it.
    fn new(
        info: StorageInfo,
        piece_hashes: PieceHashes,
        info_hash_hex: String,
        resume_validation: bool,
    ) -> std::result::Result<(Self, TorrentAlertReceiver, Option<Bitfield>), NewTorrentError> {
        // Unlike a one-shot download, a resumed torrent's directory and
        // files legitimately already exist; files are opened in append
        // mode (never truncated) so re-adding a torrent never destroys
        // partially downloaded data.
        let open_file = |info: FileInfo| {
            if let Some(parent) = info.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent).map_err(NewTorrentError::Io)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&info.path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", &info.path);
                    NewTorrentError::Io(e)
                })?;
            Ok(Mutex::new(TorrentFile { info, handle }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!("Torrent is single {} bytes long file {:?}", file.len, file.path);
                let file = FileInfo {
                    path: info.download_dir.join(&file.path),
                    torrent_offset: file.torrent_offset,
                    len: file.len,
                    pieces_root: file.pieces_root,
                };
                vec![open_file(file)?]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("Torrent is multi file");
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files.iter() {
                    let file = FileInfo {
                        path: info.download_dir.join(&file.path),
                        torrent_offset: file.torrent_offset,
                        len: file.len,
                        pieces_root: file.pieces_root,
                    };
                    torrent_files.push(open_file(file)?);
                }
                torrent_files
            }
        };

        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        // The state file lives in the save path (the configured download
        // root), keyed by info hash rather than by torrent name, so it
        // survives a rename and is unambiguous across torrents sharing a
        // download directory. An archive torrent's `download_dir` is
        // already the save path joined with the torrent's own name (see
        // `StorageInfo::new`), so its save path is one level up.
        let save_path = match &info.structure {
            FsStructure::File(_) => info.download_dir.clone(),
            FsStructure::Archive { .. } => info
                .download_dir
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| info.download_dir.clone()),
        };
        let state_path = save_path.join(format!("{}.bt.state", info_hash_hex));

        let mut resume_bitfield = fs::read(&state_path).ok().and_then(|bytes| {
            match StateFile::decode(&bytes, info.piece_count) {
                Ok(state) => Some(state.bitfield),
                Err(e) => {
                    log::warn!(
                        "Resume state file {:?} failed to decode: {}",
                        state_path, e
                    );
                    None
                }
            }
        });

        if resume_validation {
            if let Some(bitfield) = resume_bitfield.as_mut() {
                validate_resume_bitfield(&info, &piece_hashes, &files, bitfield);
            }
        }

        Ok((
            Self {
                info,
                alert_chan,
                pieces: HashMap::new(),
                files: Arc::new(files),
                piece_hashes,
                state_path,
                stats: Stats::default(),
            },
            alert_port,
            resume_bitfield,
        ))
    }

    async fn write_block(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        log::trace!("Saving block {:?} to disk", info);

        let piece_index = info.piece_index;
        if !self.pieces.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(info) {
                self.alert_chan.send(TorrentAlert::BatchWrite(Err(e)))?;
                return Ok(());
            }
        }
        let piece = self
            .pieces
            .get_mut(&piece_index)
            .expect("newly inserted piece not present");

        piece.enqueue_block(info.offset, data);

        if piece.is_complete() {
            let piece = self.pieces.remove(&piece_index).unwrap();
            let piece_len = self.info.piece_len;
            let files = Arc::clone(&self.files);

            let write_result = task::spawn_blocking(move || {
                let is_piece_valid = piece.matches_hash();

                let (write_count, blocks) = if is_piece_valid {
                    log::info!("Piece {} is valid", piece_index);
                    let piece_torrent_offset = piece_index as u64 * piece_len as u64;
                    let write_count = piece.write(piece_torrent_offset, &files)?;
                    let blocks = piece
                        .blocks
                        .iter()
                        .map(|(offset, block)| BlockInfo {
                            piece_index: info.piece_index,
                            offset: *offset,
                            len: block.len() as u32,
                        })
                        .collect();
                    (Some(write_count), blocks)
                } else {
                    log::warn!("Piece {} is NOT valid", info.piece_index);
                    (None, Vec::new())
                };

                Ok((is_piece_valid, write_count, blocks))
            })
            .await
            .expect("disk IO write task panicked");

            match write_result {
                Ok((is_piece_valid, write_count, blocks)) => {
                    if is_piece_valid {
                        if let Some(write_count) = write_count {
                            self.stats.write_count += write_count as u64;
                        }
                    }
                    self.alert_chan.send(TorrentAlert::BatchWrite(Ok(BatchWrite {
                        piece_index,
                        blocks,
                        is_piece_valid: Some(is_piece_valid),
                    })))?;
                }
                Err(e) => {
                    log::warn!("Disk write error: {:?}", e);
                    self.stats.write_failure_count += 1;
                    self.alert_chan.send(TorrentAlert::BatchWrite(Err(e)))?;
                }
            }
        }

        Ok(())
    }

    /// Reads a block back off disk to serve an upload request, run on the
    /// blocking thread pool since it's sync file IO.
    async fn read_block(&self, info: BlockInfo) -> Result<()> {
        let files = self
            .info
            .files_intersecting_piece(info.piece_index)
            .map_err(|_| Error::InvalidPieceIndex)?;
        let piece_torrent_offset =
            info.piece_index as u64 * self.info.piece_len as u64 + info.offset as u64;
        let len = info.len;
        let files_arc = Arc::clone(&self.files);
        let alert_chan = self.alert_chan.clone();

        task::spawn_blocking(move || {
            let result = read_range(&files_arc, &files, piece_torrent_offset, len);
            let alert = match result {
                Ok(data) => TorrentAlert::ReadBlock(Ok((info, data))),
                Err(e) => TorrentAlert::ReadBlock(Err(e)),
            };
            let _ = alert_chan.send(alert);
        })
        .await
        .expect("disk IO read task panicked");

        Ok(())
    }

    fn start_new_piece(&mut self, info: BlockInfo) -> std::result::Result<(), WriteError> {
        log::trace!("Creating piece {} write buffer", info.piece_index);

        let expected_hash = match &self.piece_hashes {
            PieceHashes::V1(hashes) | PieceHashes::Hybrid { v1: hashes, .. } => {
                let pos = info.piece_index * 20;
                if pos + 20 > hashes.len() {
                    return Err(WriteError {
                        piece_index: info.piece_index,
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "invalid piece index",
                        ),
                    });
                }
                let mut hash = [0; 20];
                hash.copy_from_slice(&hashes[pos..pos + 20]);
                ExpectedHash::V1(hash)
            }
            PieceHashes::V2 { piece_layers } => {
                let hash = *piece_layers.get(info.piece_index).ok_or_else(|| WriteError {
                    piece_index: info.piece_index,
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "invalid piece index",
                    ),
                })?;
                ExpectedHash::V2(hash)
            }
        };

        let len = self
            .info
            .piece_len(info.piece_index)
            .map_err(|_| WriteError {
                piece_index: info.piece_index,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "invalid piece index",
                ),
            })?;

        let files = self
            .info
            .files_intersecting_piece(info.piece_index)
            .map_err(|_| WriteError {
                piece_index: info.piece_index,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "invalid piece index",
                ),
            })?;

        let piece = Piece {
            index: info.piece_index,
            expected_hash,
            len,
            blocks: BTreeMap::new(),
            files,
        };
        self.pieces.insert(info.piece_index, piece);

        Ok(())
    }
}

/// Re-hashes every piece `bitfield` claims to have, clearing any bit whose
/// on-disk data no longer matches the expected hash (§9 `resume_validation`).
/// Used to recover from a resume state file that's stale relative to the
/// files it describes, e.g. after an out-of-band edit or a prior unclean
/// shutdown that lost some already-flushed writes.
fn validate_resume_bitfield(
    info: &StorageInfo,
    piece_hashes: &PieceHashes,
    files: &[Mutex<TorrentFile>],
    bitfield: &mut Bitfield,
) {
    for index in 0..info.piece_count.min(bitfield.len()) {
        if !bitfield[index] {
            continue;
        }
        let valid = (|| -> Result<bool> {
            let len = info.piece_len(index)?;
            let file_range = info.files_intersecting_piece(index)?;
            let torrent_offset = index as u64 * info.piece_len as u64;
            let data = read_range(files, &file_range, torrent_offset, len)?;
            Ok(match piece_hashes {
                PieceHashes::V1(hashes) | PieceHashes::Hybrid { v1: hashes, .. } => {
                    let pos = index * 20;
                    pos + 20 <= hashes.len() && {
                        let mut hash = [0u8; 20];
                        hash.copy_from_slice(&hashes[pos..pos + 20]);
                        verify::verify_v1(&data, &hash)
                    }
                }
                PieceHashes::V2 { piece_layers } => piece_layers
                    .get(index)
                    .map(|hash| verify::verify_v2_leaf(&data, hash))
                    .unwrap_or(false),
            })
        })()
        .unwrap_or(false);

        if !valid {
            bitfield.set(index, false);
        }
    }
}

fn read_range(
    files: &[Mutex<TorrentFile>],
    file_range: &Range<FileIndex>,
    torrent_offset: u64,
    len: u32,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len as usize);
    let mut remaining = len as u64;
    let mut offset = torrent_offset;
    for file in &files[file_range.clone()] {
        if remaining == 0 {
            break;
        }
        let file = file.lock().unwrap();
        let slice = file.info.get_slice(offset, remaining);
        let mut buf = vec![0u8; slice.len as usize];
        file.read_at(slice.offset, &mut buf)?;
        offset += slice.len;
        remaining -= slice.len;
        out.extend_from_slice(&buf);
    }
    Ok(out)
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    fn write_vectored_at<'a>(
        &self,
        iovecs: &mut IoVecs<'a>,
        offset: u64,
        piece_index: PieceIndex,
    ) -> std::result::Result<usize, WriteError> {
        let mut total_write_count = 0;
        while !iovecs.buffers().is_empty() {
            let write_count = pwritev(self.handle.as_raw_fd(), &iovecs.buffers(), offset as i64)
                .map_err(|_| WriteError {
                    piece_index,
                    source: std::io::Error::last_os_error(),
                })?;
            iovecs.advance(write_count);
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.handle.read_exact_at(buf, offset)?;
        Ok(())
    }
}

#[derive(Default)]
struct Stats {
    write_count: u64,
    write_failure_count: usize,
}

#[derive(Clone, Copy, Debug)]
enum ExpectedHash {
    V1(Sha1Hash),
    V2(crate::Sha256Hash),
}

struct Piece {
    index: PieceIndex,
    expected_hash: ExpectedHash,
    len: u32,
    blocks: BTreeMap<u32, Vec<u8>>,
    files: Range<FileIndex>,
}

impl Piece {
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Concatenates this piece's blocks into one contiguous buffer. Only
    /// called once the piece is complete, so this never allocates more
    /// than one piece's worth of memory at a time.
    fn concat_blocks(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len as usize);
        for block in self.blocks.values() {
            out.extend_from_slice(block);
        }
        out
    }

    fn matches_hash(&self) -> bool {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        match &self.expected_hash {
            ExpectedHash::V1(expected) => {
                let mut hasher = Sha1::new();
                for block in self.blocks.values() {
                    hasher.update(block);
                }
                let hash = hasher.finalize();
                hash.as_slice() == expected
            }
            ExpectedHash::V2(expected_root) => {
                let data = self.concat_blocks();
                verify::merkle_root(&data) == *expected_root
            }
        }
    }

    fn write(
        &self,
        piece_torrent_offset: u64,
        files: &[Mutex<TorrentFile>],
    ) -> std::result::Result<usize, WriteError> {
        let mut total_write_count = 0;

        let blocks: Vec<_> = self.blocks.values().map(|b| IoVec::from_slice(b)).collect();
        let mut blocks = blocks;
        let mut bufs = blocks.as_mut_slice();
        let mut write_torrent_offset = piece_torrent_offset;

        let files = &files[self.files.clone()];
        debug_assert!(!files.is_empty());
        if files.len() == 1 {
            let file = files.first().unwrap().lock().unwrap();
            let slice = file.info.get_slice(write_torrent_offset, self.len as u64);
            let mut iovecs = IoVecs::unbounded(bufs);
            total_write_count += file.write_vectored_at(&mut iovecs, slice.offset, self.index)?;
            bufs = iovecs.into_tail();
        } else {
            for file in files.iter() {
                let file = file.lock().unwrap();
                let slice = file.info.get_slice(write_torrent_offset, self.len as u64);
                debug_assert!(slice.len > 0);
                debug_assert!(!bufs.is_empty());

                let mut iovecs = IoVecs::bounded(bufs, slice.len as usize);
                let write_count = file.write_vectored_at(&mut iovecs, slice.offset, self.index)?;
                bufs = iovecs.into_tail();

                write_torrent_offset += write_count as u64;
                total_write_count += write_count;
            }
        }

        debug_assert!(bufs.is_empty());
        Ok(total_write_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_completion_by_block_count() {
        let piece = Piece {
            index: 0,
            expected_hash: ExpectedHash::V1([0; 20]),
            len: crate::BLOCK_LEN * 2,
            blocks: BTreeMap::new(),
            files: 0..1,
        };
        assert!(!piece.is_complete());
    }
}
