//! Decodes a `.torrent` file's bencoded metainfo into the normalized
//! [`Metainfo`] the rest of the engine consumes (§3, §9: "the core must
//! consume [the bencode tree] via a typed `Torrent` descriptor constructed
//! at load time, never passing untyped maps across module boundaries").

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

/// A decoded and normalized `.torrent` file.
///
/// This is constructed once, from the raw bencode dictionary, and is
/// treated as immutable for the rest of the torrent's lifetime.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The torrent's name, used as the default download directory name for
    /// multi-file torrents, or the file name for single-file torrents.
    pub name: String,
    /// The announce URL, as a raw string (its scheme is validated by the
    /// tracker client, which is outside the core's scope).
    pub announce: String,
    /// SHA-1 of the bencoded `info` dictionary; the torrent's unique id.
    pub info_hash: Sha1Hash,
    /// The nominal length of a piece, in bytes.
    pub piece_len: u32,
    /// The concatenation of each piece's 20 byte SHA-1 hash, in piece
    /// order.
    pub piece_hashes: Vec<u8>,
    /// The file(s) this torrent describes.
    pub structure: FsStructure,
}

impl Metainfo {
    /// Parses a `.torrent` file's raw bytes into a normalized metainfo.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;

        let info_hash = {
            let info_bytes = serde_bencode::to_bytes(&raw.info)?;
            let digest = Sha1::digest(&info_bytes);
            let mut info_hash = [0; 20];
            info_hash.copy_from_slice(&digest);
            info_hash
        };

        let structure = match raw.info.files {
            Some(files) => {
                let mut torrent_offset = 0;
                let files = files
                    .into_iter()
                    .map(|file| {
                        let path: PathBuf = file.path.iter().collect();
                        let len = file.length as u64;
                        let info = FileInfo {
                            path,
                            len,
                            torrent_offset,
                        };
                        torrent_offset += len;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
            None => {
                let len = raw.info.length.ok_or_else(|| {
                    Error::InvalidMetainfo(
                        "info dictionary has neither `length` nor `files`"
                            .into(),
                    )
                })?;
                FsStructure::File(FileInfo {
                    path: PathBuf::from(&raw.info.name),
                    len,
                    torrent_offset: 0,
                })
            }
        };

        if raw.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "piece hash string length is not a multiple of 20".into(),
            ));
        }

        Ok(Self {
            name: raw.info.name,
            announce: raw.announce,
            info_hash,
            piece_len: raw.info.piece_length as u32,
            piece_hashes: raw.info.pieces,
            structure,
        })
    }

    /// Returns the number of pieces in the torrent, derived from the length
    /// of the concatenated piece hash string.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / 20
    }

    /// Returns the expected hash of the piece at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn piece_hash(&self, index: usize) -> Sha1Hash {
        let pos = index * 20;
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[pos..pos + 20]);
        hash
    }
}

/// The raw, unnormalized top-level bencode dictionary of a `.torrent` file.
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: String,
    info: RawInfo,
}

/// The raw `info` sub-dictionary, exactly as it appears on the wire (and as
/// it must be re-encoded, byte-for-byte, to derive the info hash).
#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u64,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
}

/// A single file entry in a multi-file torrent's `info.files` list.
#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bencode::ser::to_bytes;

    fn bencode_single_file_torrent() -> Vec<u8> {
        #[derive(Serialize)]
        struct Info {
            name: String,
            #[serde(with = "serde_bytes")]
            pieces: Vec<u8>,
            #[serde(rename = "piece length")]
            piece_length: u64,
            length: u64,
        }
        #[derive(Serialize)]
        struct Meta {
            announce: String,
            info: Info,
        }
        let meta = Meta {
            announce: "http://tracker.example.com/announce".into(),
            info: Info {
                name: "foo.txt".into(),
                pieces: vec![0u8; 40],
                piece_length: 16384,
                length: 30000,
            },
        };
        to_bytes(&meta).unwrap()
    }

    #[test]
    fn parses_single_file_torrent() {
        let bytes = bencode_single_file_torrent();
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.name, "foo.txt");
        assert_eq!(metainfo.announce, "http://tracker.example.com/announce");
        assert_eq!(metainfo.piece_len, 16384);
        assert_eq!(metainfo.piece_count(), 2);
        match &metainfo.structure {
            FsStructure::File(file) => {
                assert_eq!(file.len, 30000);
                assert_eq!(file.torrent_offset, 0);
            }
            FsStructure::Archive { .. } => panic!("expected single file"),
        }
    }

    #[test]
    fn info_hash_is_deterministic() {
        let bytes = bencode_single_file_torrent();
        let a = Metainfo::from_bytes(&bytes).unwrap();
        let b = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }

    #[test]
    fn rejects_malformed_piece_hash_length() {
        #[derive(Serialize)]
        struct Info {
            name: String,
            #[serde(with = "serde_bytes")]
            pieces: Vec<u8>,
            #[serde(rename = "piece length")]
            piece_length: u64,
            length: u64,
        }
        #[derive(Serialize)]
        struct Meta {
            announce: String,
            info: Info,
        }
        let meta = Meta {
            announce: "http://tracker.example.com/announce".into(),
            info: Info {
                name: "foo.txt".into(),
                pieces: vec![0u8; 19],
                piece_length: 16384,
                length: 30000,
            },
        };
        let bytes = to_bytes(&meta).unwrap();
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }
}
