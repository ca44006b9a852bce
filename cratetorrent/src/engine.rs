//! The library's public facade: starts the disk IO task once, assigns
//! [`TorrentId`]s, and spawns a [`torrent`](crate::torrent) entry per
//! download, forwarding their progress and completion as [`Alert`]s.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use tokio::sync::mpsc;

use crate::{
    conf::Conf, disk::DiskHandle, error::Error, error::Result,
    metainfo::Metainfo, torrent, TorrentConf, TorrentId,
};

/// Out-of-band events the engine reports to its owner as torrents progress,
/// complete, or fail (§6, §7).
#[derive(Debug)]
pub enum Alert {
    /// Reported once a second while a torrent is downloading (§6's
    /// "Downloaded X%  Pieces d/N" line).
    TorrentStats {
        id: TorrentId,
        downloaded_piece_count: usize,
        piece_count: usize,
    },
    /// Every piece has been downloaded, verified, and persisted.
    TorrentComplete { id: TorrentId },
    /// The torrent failed fatally: tracker failure, no peer ever ready, or
    /// a startup-time metainfo/IO error (§7's propagation policy).
    Error { id: TorrentId, error: Error },
}

/// Parameters for starting a new torrent download.
pub struct TorrentParams {
    /// The parsed `.torrent` metainfo.
    pub metainfo: Metainfo,
    /// Per-torrent configuration overrides. `None` uses the engine's
    /// default `TorrentConf`.
    pub conf: Option<TorrentConf>,
}

/// The multi-torrent engine: owns the single disk IO task shared by all
/// torrents and the process-wide client identity, and exposes an `Alert`
/// stream to its caller.
pub struct Engine {
    conf: Conf,
    disk: DiskHandle,
    alert_chan: mpsc::UnboundedSender<Alert>,
    next_id: Arc<AtomicU32>,
}

impl Engine {
    /// Starts the engine: spawns the disk IO task and returns a handle to
    /// it alongside the channel on which `Alert`s will arrive.
    pub fn new(conf: Conf) -> Result<(Self, mpsc::UnboundedReceiver<Alert>)> {
        let disk = DiskHandle::spawn()?;
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                conf,
                disk,
                alert_chan,
                next_id: Arc::new(AtomicU32::new(0)),
            },
            alert_port,
        ))
    }

    /// Registers a new torrent and starts downloading it: announces to its
    /// tracker, connects to the returned peers, and runs the scheduler
    /// until every piece is downloaded. Returns immediately with the
    /// assigned `TorrentId`; progress and completion arrive as `Alert`s.
    pub fn create_torrent(&self, params: TorrentParams) -> Result<TorrentId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let torrent_conf = params.conf.unwrap_or_else(|| self.conf.torrent.clone());
        log::info!("Creating torrent {} ({:?})", id, torrent_conf.download_dir);
        torrent::start(
            id,
            params.metainfo,
            torrent_conf,
            self.conf.engine.identity.clone(),
            self.disk.clone(),
            self.alert_chan.clone(),
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metainfo::Metainfo, storage_info::FsStructure, FileInfo};
    use std::path::PathBuf;

    fn minimal_metainfo() -> Metainfo {
        Metainfo {
            name: "test.bin".into(),
            announce: "http://tracker.example.com/announce".into(),
            info_hash: [0u8; 20],
            piece_len: 16384,
            piece_hashes: vec![0u8; 20],
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("test.bin"),
                len: 16384,
                torrent_offset: 0,
            }),
        }
    }

    #[tokio::test]
    async fn assigns_increasing_torrent_ids() {
        let (engine, _alerts) = Engine::new(Conf::new(std::env::temp_dir()))
            .expect("engine should start");
        let metainfo = minimal_metainfo();
        let first = engine
            .create_torrent(TorrentParams {
                metainfo: metainfo.clone(),
                conf: None,
            })
            .unwrap();
        let second = engine
            .create_torrent(TorrentParams {
                metainfo,
                conf: None,
            })
            .unwrap();
        assert_eq!(second, first + 1);
    }
}
