use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    os::unix::fs::FileExt,
    sync::{Arc, Mutex},
};

use tokio::task;

use super::{Command, CommandReceiver, CommandSender};
use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure, StorageInfo},
    PieceIndex, TorrentId,
};

/// The entity responsible for creating a torrent's files up front and
/// writing verified pieces to the correct offsets within them (§4.4).
pub(super) struct Disk {
    torrents: HashMap<TorrentId, Torrent>,
    cmd_port: CommandReceiver,
}

impl Disk {
    pub(super) fn new() -> Result<(Self, CommandSender)> {
        let (cmd_chan, cmd_port) = tokio::sync::mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
            },
            cmd_chan,
        ))
    }

    pub(super) async fn start(&mut self) {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent { id, info, result } => {
                    let _ = result.send(self.new_torrent(id, info));
                }
                Command::WritePiece {
                    id,
                    index,
                    data,
                    result,
                } => {
                    let outcome = self.write_piece(id, index, data).await;
                    let _ = result.send(outcome);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
    }

    fn new_torrent(&mut self, id: TorrentId, info: StorageInfo) -> Result<()> {
        if self.torrents.contains_key(&id) {
            log::warn!("Torrent {} already allocated", id);
            return Err(Error::InvalidTorrentId);
        }

        let torrent = Torrent::new(info)?;
        self.torrents.insert(id, torrent);
        log::info!("Torrent {} allocated on disk", id);
        Ok(())
    }

    async fn write_piece(
        &self,
        id: TorrentId,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving torrent {} piece {} to disk", id, index);
        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })?;
        torrent.write_piece(index, data).await
    }
}

/// A torrent's disk-related state: its open file handles.
struct Torrent {
    info: StorageInfo,
    files: Arc<Vec<Mutex<TorrentFile>>>,
}

impl Torrent {
    /// Creates the torrent's directory structure and opens (creating, if
    /// necessary) every file it lists.
    fn new(info: StorageInfo) -> Result<Self> {
        let open_file = |file: &FileInfo| -> Result<Mutex<TorrentFile>> {
            if let Some(parent) = file.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&file.path)?;
            Ok(Mutex::new(TorrentFile {
                info: file.clone(),
                handle,
            }))
        };

        if !info.download_dir.exists() {
            fs::create_dir_all(&info.download_dir)?;
        }

        let files = match &info.structure {
            FsStructure::File(file) => {
                let file = FileInfo {
                    path: info.download_dir.join(&file.path),
                    ..file.clone()
                };
                vec![open_file(&file)?]
            }
            FsStructure::Archive { files } => files
                .iter()
                .map(|file| {
                    let file = FileInfo {
                        path: info.download_dir.join(&file.path),
                        ..file.clone()
                    };
                    open_file(&file)
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(Self {
            info,
            files: Arc::new(files),
        })
    }

    /// Writes a piece's already hash-verified bytes into every file it
    /// overlaps, per the offset arithmetic in §4.4.
    async fn write_piece(
        &self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        let piece_len = self.info.piece_len(index)?;
        debug_assert_eq!(data.len(), piece_len as usize);

        let file_range = self.info.files_intersecting_piece(index)?;
        let piece_torrent_offset = index as u64 * self.info.piece_len as u64;
        let files = Arc::clone(&self.files);

        // file writes are synchronous, so don't block the reactor
        let result = task::spawn_blocking(move || -> Result<()> {
            // `cursor` is how many bytes of `data` have already been placed
            // in a prior file; it equals `w_s` for the file about to be
            // written.
            let mut cursor = 0u64;
            for file in &files[file_range] {
                let file = file.lock().unwrap();
                let torrent_offset = piece_torrent_offset + cursor;
                let remaining = piece_len as u64 - cursor;
                let slice = file.info.get_slice(torrent_offset, remaining);
                let w_s = cursor as usize;
                let w_e = w_s + slice.len as usize;
                file.handle.write_at(&data[w_s..w_e], slice.offset)?;
                cursor += slice.len;
            }
            debug_assert_eq!(cursor, piece_len as u64);
            Ok(())
        })
        .await
        .expect("disk IO write task panicked");

        if let Err(e) = &result {
            log::warn!("Disk write error for piece {}: {}", index, e);
        }

        result
    }
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn writes_single_file_piece_at_expected_offset() {
        let dir = std::env::temp_dir().join(format!(
            "cratetorrent-disk-test-{}",
            rand::random::<u32>()
        ));
        let info = StorageInfo {
            piece_count: 2,
            piece_len: 4,
            last_piece_len: 2,
            download_len: 6,
            download_dir: dir.clone(),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("out.bin"),
                len: 6,
                torrent_offset: 0,
            }),
        };
        let torrent = Torrent::new(info).unwrap();
        torrent.write_piece(0, vec![1, 2, 3, 4]).await.unwrap();
        torrent.write_piece(1, vec![5, 6]).await.unwrap();

        let written = fs::read(dir.join("out.bin")).unwrap();
        assert_eq!(written, vec![1, 2, 3, 4, 5, 6]);

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn writes_piece_straddling_two_files() {
        // mirrors spec scenario 4: files A(20000,start=0), B(20000,start=20000),
        // piece_length=12000, piece index 1 spans [12000,24000).
        let dir = std::env::temp_dir().join(format!(
            "cratetorrent-disk-test-straddle-{}",
            rand::random::<u32>()
        ));
        let info = StorageInfo {
            piece_count: 4,
            piece_len: 12000,
            last_piece_len: 4000,
            download_len: 40000,
            download_dir: dir.clone(),
            structure: FsStructure::Archive {
                files: vec![
                    FileInfo {
                        path: PathBuf::from("a.bin"),
                        len: 20000,
                        torrent_offset: 0,
                    },
                    FileInfo {
                        path: PathBuf::from("b.bin"),
                        len: 20000,
                        torrent_offset: 20000,
                    },
                ],
            },
        };
        let torrent = Torrent::new(info).unwrap();
        let mut data = vec![0u8; 12000];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        torrent.write_piece(1, data.clone()).await.unwrap();

        let a = fs::read(dir.join("a.bin")).unwrap();
        let b = fs::read(dir.join("b.bin")).unwrap();
        assert_eq!(&a[12000..20000], &data[0..8000]);
        assert_eq!(&b[0..4000], &data[8000..12000]);

        fs::remove_dir_all(&dir).ok();
    }
}
