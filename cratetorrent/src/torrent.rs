//! Per-torrent orchestration: builds a torrent's pieces, announces to its
//! tracker, and drives the scheduler to completion on its own task,
//! forwarding progress and completion as [`Alert`](crate::engine::Alert)s
//! back to the engine.

use std::{sync::atomic::Ordering, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    task, time,
};

use crate::{
    conf::TorrentConf,
    disk::DiskHandle,
    engine::Alert,
    error::Result,
    identity::ClientIdentity,
    metainfo::Metainfo,
    piece::Piece,
    scheduler::Scheduler,
    storage_info::StorageInfo,
    tracker, PieceIndex, TorrentId,
};

/// How often the progress observer reports a torrent's status (§4.2 phase
/// 3, §6).
const PROGRESS_TICK: Duration = Duration::from_secs(1);

/// Materializes the piece list from a metainfo's hash list and the
/// storage info's per-piece lengths (§3, §4.3).
fn build_pieces(
    metainfo: &Metainfo,
    storage: &StorageInfo,
) -> Result<Vec<Piece>> {
    (0..metainfo.piece_count())
        .map(|index: PieceIndex| {
            let len = storage.piece_len(index)?;
            Ok(Piece::new(index, len, metainfo.piece_hash(index)))
        })
        .collect()
}

/// Spawns the task that owns a single torrent's entire lifetime: tracker
/// announce, scheduler run, and progress reporting. Runs until the torrent
/// completes or hits a fatal error, either of which is reported on
/// `alert_chan`.
pub(crate) fn start(
    id: TorrentId,
    metainfo: Metainfo,
    conf: TorrentConf,
    identity: ClientIdentity,
    disk: DiskHandle,
    alert_chan: mpsc::UnboundedSender<Alert>,
) {
    task::spawn(async move {
        match run(id, metainfo, conf, identity, disk, alert_chan.clone()).await
        {
            Ok(()) => {
                let _ = alert_chan.send(Alert::TorrentComplete { id });
            }
            Err(e) => {
                log::error!("Torrent {} failed: {}", id, e);
                let _ = alert_chan.send(Alert::Error { id, error: e });
            }
        }
    });
}

async fn run(
    id: TorrentId,
    metainfo: Metainfo,
    conf: TorrentConf,
    identity: ClientIdentity,
    disk: DiskHandle,
    alert_chan: mpsc::UnboundedSender<Alert>,
) -> Result<()> {
    let storage_info = StorageInfo::new(&metainfo, conf.download_dir.clone());
    disk.allocate_new_torrent(id, storage_info.clone()).await?;

    let pieces = build_pieces(&metainfo, &storage_info)?;
    let piece_count = pieces.len();

    log::info!(
        "Announcing torrent {} ({} pieces) to {}",
        id,
        piece_count,
        metainfo.announce
    );
    let mut announce = tracker::announce(&metainfo, &identity).await?;
    log::info!(
        "Tracker returned {} peers for torrent {}",
        announce.peers.len(),
        id
    );
    if announce.peers.len() > conf.max_connected_peer_count {
        log::info!(
            "Capping torrent {} to {} of {} tracker peers",
            id,
            conf.max_connected_peer_count,
            announce.peers.len()
        );
        announce.peers.truncate(conf.max_connected_peer_count);
    }

    let mut scheduler = Scheduler::new(
        id,
        metainfo.info_hash,
        identity,
        conf,
        disk,
        pieces,
        announce.peers,
    );
    let progress = scheduler.progress_handle();
    let (shutdown_chan, shutdown_port) = oneshot::channel();
    task::spawn(report_progress(
        id,
        piece_count,
        progress,
        alert_chan,
        shutdown_port,
    ));

    let result = scheduler.run().await;
    let _ = shutdown_chan.send(());
    result
}

/// Periodically reports a torrent's completed-piece count until it's done,
/// per spec §6's once-a-second progress line, or until `shutdown` fires
/// because the scheduler returned first. Reads the scheduler's progress
/// counter directly rather than owning the scheduler, since the
/// scheduler's dispatch loop needs exclusive access to itself while it
/// runs (§9 design note on avoiding cyclic ownership).
async fn report_progress(
    id: TorrentId,
    piece_count: usize,
    progress: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    alert_chan: mpsc::UnboundedSender<Alert>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut interval = time::interval(PROGRESS_TICK);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let downloaded = progress.load(Ordering::Relaxed);
                let _ = alert_chan.send(Alert::TorrentStats {
                    id,
                    downloaded_piece_count: downloaded,
                    piece_count,
                });
                if downloaded >= piece_count {
                    break;
                }
            }
            _ = &mut shutdown => break,
        }
    }
}
