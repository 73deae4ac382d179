//! Parsing of the bencoded `.torrent` metainfo format (§6), for v1, v2, and
//! hybrid torrents.

use std::collections::BTreeMap;

use serde_bencode::Error;
use serde_bytes::ByteBuf;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha256Digest, Sha256};

use crate::storage_info::{FileInfo, FsStructure};
use crate::{FileIndex, InfoHash, Sha1Hash, Sha256Hash};

/// Which of the three wire formats a torrent was published in (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
    Hybrid,
}

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,
    /// v2/hybrid only: per-file-root concatenated Merkle layer hashes.
    #[serde(rename = "piece layers")]
    pub piece_layers: Option<BTreeMap<ByteBuf, ByteBuf>>,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        serde_bencode::from_bytes(buf)
    }

    /// Returns the v1 SHA-1 info hash (bencode of the `info` dict, hashed).
    pub fn create_v1_info_hash(&self) -> Result<Sha1Hash, Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Returns the v2 SHA-256 info hash, present only when the info dict
    /// carries `meta version = 2` and a `file tree`.
    pub fn create_v2_info_hash(&self) -> Result<Option<Sha256Hash>, Error> {
        if self.info.file_tree.is_none() {
            return Ok(None);
        }
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha256::digest(&info);
        let mut info_hash = [0; 32];
        info_hash.copy_from_slice(&digest);
        Ok(Some(info_hash))
    }

    /// Returns the combined [`InfoHash`] for this torrent's declared
    /// version.
    pub fn info_hash(&self) -> Result<InfoHash, Error> {
        let v1 = self.create_v1_info_hash()?;
        let v2 = self.create_v2_info_hash()?;
        Ok(match (self.version(), v2) {
            (Version::V2, Some(v2)) => InfoHash::V2(v2),
            (Version::Hybrid, Some(v2)) => InfoHash::Hybrid(v1, v2),
            _ => InfoHash::V1(v1),
        })
    }

    /// Which of v1/v2/hybrid this torrent is, determined from the presence
    /// of the v1 `pieces` field and the v2 `file tree`/`meta version`.
    pub fn version(&self) -> Version {
        let has_v1_pieces = !self.info.pieces.is_empty();
        let has_v2_tree = self.info.file_tree.is_some();
        match (has_v1_pieces, has_v2_tree) {
            (true, true) => Version::Hybrid,
            (false, true) => Version::V2,
            _ => Version::V1,
        }
    }

    /// The number of pieces, derived from the v1 hash list length for
    /// v1/hybrid torrents, or from the total length for pure v2 torrents.
    pub fn piece_count(&self) -> usize {
        if !self.info.pieces.is_empty() {
            self.info.pieces.len() / 20
        } else {
            let total = self.structure().download_len();
            ((total + self.info.piece_length - 1) / self.info.piece_length) as usize
        }
    }

    /// Returns the v2 Merkle leaf hashes for a single file, looked up in the
    /// `piece layers` dict by the file's `pieces_root`. Returns `None` for a
    /// v1-only file, or if the root is absent from `piece layers` (e.g. the
    /// file is short enough that its root equals its own single leaf hash,
    /// per BEP 52, and so carries no `piece layers` entry).
    pub fn file_piece_layer_hashes(&self, file: &FileInfo) -> Option<Vec<Sha256Hash>> {
        let root = file.pieces_root?;
        let layers = self.piece_layers.as_ref()?;
        let key = ByteBuf::from(root.to_vec());
        let raw = layers.get(&key)?;
        Some(
            raw.chunks_exact(32)
                .map(|chunk| {
                    let mut hash = [0; 32];
                    hash.copy_from_slice(chunk);
                    hash
                })
                .collect(),
        )
    }

    /// Returns the `i`-th v1 piece hash.
    pub fn piece_hash(&self, index: usize) -> Option<Sha1Hash> {
        let start = index * 20;
        let end = start + 20;
        if end > self.info.pieces.len() {
            return None;
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[start..end]);
        Some(hash)
    }

    /// Builds the [`FsStructure`] describing the on-disk file layout.
    pub fn structure(&self) -> FsStructure {
        if let Some(files) = &self.info.files {
            let mut offset = 0u64;
            let infos = files
                .iter()
                .map(|f| {
                    let info = FileInfo {
                        path: f.path.iter().collect(),
                        len: f.length as u64,
                        torrent_offset: offset,
                        pieces_root: None,
                    };
                    offset += info.len;
                    info
                })
                .collect();
            FsStructure::Archive { files: infos }
        } else if let Some(tree) = &self.info.file_tree {
            // v2 `file tree`: a recursive dict of path components to
            // `{length, pieces root}` leaves, or a single-file torrent if
            // the tree has one leaf directly under the name.
            let mut files = Vec::new();
            let mut offset = 0u64;
            flatten_file_tree(tree, &mut Vec::new(), &mut files, &mut offset);
            if files.len() == 1 && files[0].path.as_os_str().is_empty() {
                let mut f = files.remove(0);
                f.path = self.info.name.clone().into();
                FsStructure::File(f)
            } else {
                FsStructure::Archive { files }
            }
        } else {
            FsStructure::File(FileInfo {
                path: self.info.name.clone().into(),
                len: self.info.length.unwrap_or(0) as u64,
                torrent_offset: 0,
                pieces_root: None,
            })
        }
    }
}

/// A node of the v2 `file tree`: either a nested directory, or a leaf
/// `{length, pieces root}` entry, represented here as bencode's untyped
/// dictionary-of-dictionaries. We decode the two shapes by probing for a
/// `length` key.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FileTreeNode {
    Leaf {
        length: u64,
        #[serde(rename = "pieces root", default)]
        pieces_root: Option<ByteBuf>,
    },
    Dir(BTreeMap<String, FileTreeNode>),
}

fn flatten_file_tree(
    tree: &BTreeMap<String, FileTreeNode>,
    prefix: &mut Vec<String>,
    out: &mut Vec<FileInfo>,
    offset: &mut u64,
) {
    for (name, node) in tree {
        prefix.push(name.clone());
        match node {
            FileTreeNode::Leaf { length, pieces_root } => {
                // the v2 spec encodes a zero-length "sentinel" empty string
                // key for a file whose name is the directory itself; treat
                // the accumulated prefix (minus an empty trailing segment)
                // as the path
                let path: std::path::PathBuf = prefix
                    .iter()
                    .filter(|c| !c.is_empty())
                    .collect();
                let pieces_root = pieces_root.as_ref().and_then(|root| {
                    crate::Sha256Hash::try_from(root.as_ref() as &[u8]).ok()
                });
                out.push(FileInfo {
                    path,
                    len: *length,
                    torrent_offset: *offset,
                    pieces_root,
                });
                *offset += length;
            }
            FileTreeNode::Dir(children) => {
                flatten_file_tree(children, prefix, out, offset);
            }
        }
        prefix.pop();
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes", default)]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
    #[serde(rename = "meta version")]
    pub meta_version: Option<u32>,
    #[serde(rename = "file tree", default)]
    pub file_tree: Option<BTreeMap<String, FileTreeNode>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

#[allow(dead_code)]
pub(crate) type FileRootMap = BTreeMap<FileIndex, Sha256Hash>;

#[cfg(test)]
mod tests {
    use super::*;

    fn v1_bytes() -> Vec<u8> {
        // a minimal single-file v1 torrent: one 4-byte piece
        let bencode = b"d4:infod6:lengthi4e4:name4:file12:piece lengthi4e6:pieces20:\x01\x02\x03\x04\x05\x06\x07\x08\x09\x10\x11\x12\x13\x14\x15\x16\x17\x18\x19\x20eee";
        bencode.to_vec()
    }

    #[test]
    fn test_parse_v1_single_file() {
        let metainfo = Metainfo::from_bytes(&v1_bytes()).unwrap();
        assert_eq!(metainfo.version(), Version::V1);
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(metainfo.info.name, "file");
        let structure = metainfo.structure();
        assert_eq!(structure.download_len(), 4);
    }

    #[test]
    fn test_v1_info_hash_is_deterministic() {
        let metainfo = Metainfo::from_bytes(&v1_bytes()).unwrap();
        let h1 = metainfo.create_v1_info_hash().unwrap();
        let h2 = metainfo.create_v1_info_hash().unwrap();
        assert_eq!(h1, h2);
    }
}
