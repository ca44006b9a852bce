//! Drives a set of peer sessions to download every piece of a torrent
//! exactly once (§4.2).
//!
//! Each peer session runs on its own task and owns its TCP connection
//! exclusively; the scheduler only ever talks to it through a command
//! channel and a periodically refreshed read-only status snapshot, per the
//! "cyclic references" design note (§9): the scheduler owns piece data,
//! peers own sockets, and the two communicate through handles rather than
//! shared ownership of each other.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task,
};

use crate::{
    conf::TorrentConf,
    disk::DiskHandle,
    error::{Error, Result},
    identity::ClientIdentity,
    peer::PeerSession,
    piece::{Piece, PieceStatus},
    Bitfield, PieceIndex, Sha1Hash, TorrentId,
};

/// A read-only snapshot of a peer session's scheduling-relevant state. The
/// peer's own task refreshes this after every state transition, so the
/// scheduler never needs to touch the session (or its socket) directly.
#[derive(Clone, Debug, Default)]
struct PeerSnapshot {
    ready: bool,
    alive: bool,
    free: bool,
    bitfield: Bitfield,
}

impl PeerSnapshot {
    fn has_piece(&self, index: PieceIndex) -> bool {
        self.ready && index < self.bitfield.len() && self.bitfield[index]
    }
}

/// Commands the scheduler sends to a peer's dedicated task.
enum PeerCommand {
    Connect,
    Download(Arc<Piece>, oneshot::Sender<Result<Vec<u8>>>),
    Shutdown,
}

/// The scheduler's side of a peer session running on its own task.
struct PeerHandle {
    addr: SocketAddr,
    status: Arc<Mutex<PeerSnapshot>>,
    cmd_chan: mpsc::UnboundedSender<PeerCommand>,
}

/// Runs a single peer session for its entire lifetime, processing one
/// command at a time (connecting and downloading are mutually exclusive,
/// which matches `is_free()`'s single-flight contract).
async fn run_peer_task(
    mut session: PeerSession,
    status: Arc<Mutex<PeerSnapshot>>,
    mut cmd_port: mpsc::UnboundedReceiver<PeerCommand>,
) {
    // Ticks more finely than the session's own keep-alive interval so that
    // a session idling between piece assignments still gets to send one in
    // time; `send_keepalive_if_idle` itself gates on whether enough time has
    // actually elapsed.
    let keepalive_tick = session.keepalive_interval() / 4;
    let mut keepalive_ticker = tokio::time::interval(keepalive_tick);

    loop {
        tokio::select! {
            cmd = cmd_port.recv() => {
                let cmd = match cmd {
                    Some(cmd) => cmd,
                    None => break,
                };
                match cmd {
                    PeerCommand::Connect => {
                        if let Err(e) = session.connect_and_prepare().await {
                            log::info!(
                                "Peer {} failed to become ready: {}",
                                session.addr(),
                                e
                            );
                        }
                        refresh(&session, &status).await;
                    }
                    PeerCommand::Download(piece, reply) => {
                        let result = session.download_piece(&piece).await;
                        refresh(&session, &status).await;
                        let _ = reply.send(result);
                    }
                    PeerCommand::Shutdown => break,
                }
            }
            _ = keepalive_ticker.tick() => {
                if let Err(e) = session.send_keepalive_if_idle().await {
                    log::info!(
                        "Peer {} keep-alive failed: {}",
                        session.addr(),
                        e
                    );
                    refresh(&session, &status).await;
                }
            }
        }
    }
}

async fn refresh(session: &PeerSession, status: &Arc<Mutex<PeerSnapshot>>) {
    let mut status = status.lock().await;
    status.ready = session.is_ready();
    status.alive = session.is_alive();
    status.free = session.is_free();
    status.bitfield = session.bitfield().clone();
}

/// Drives every candidate peer concurrently until all of a torrent's pieces
/// are downloaded.
pub(crate) struct Scheduler {
    pieces: Vec<Arc<Piece>>,
    statuses: Vec<PieceStatus>,
    peers: Vec<PeerHandle>,
    conf: TorrentConf,
    /// The number of downloaded pieces, updated as the dispatch loop
    /// observes completions. Shared with a progress-reporting task so it
    /// can be read without synchronizing with the dispatch loop itself.
    progress: Arc<AtomicUsize>,
}

impl Scheduler {
    pub(crate) fn new(
        torrent_id: TorrentId,
        info_hash: Sha1Hash,
        identity: ClientIdentity,
        conf: TorrentConf,
        disk: DiskHandle,
        pieces: Vec<Piece>,
        peer_addrs: Vec<SocketAddr>,
    ) -> Self {
        let piece_count = pieces.len();
        let statuses = pieces.iter().map(|p| p.status).collect();
        let pieces = pieces.into_iter().map(Arc::new).collect();

        let peers = peer_addrs
            .into_iter()
            .map(|addr| {
                let session = PeerSession::new(
                    addr,
                    info_hash,
                    identity.clone(),
                    conf.clone(),
                    torrent_id,
                    piece_count,
                    disk.clone(),
                );
                let status = Arc::new(Mutex::new(PeerSnapshot::default()));
                let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
                task::spawn(run_peer_task(session, Arc::clone(&status), cmd_port));
                PeerHandle {
                    addr,
                    status,
                    cmd_chan,
                }
            })
            .collect();

        Self {
            pieces,
            statuses,
            peers,
            conf,
            progress: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns a handle that always reflects the number of pieces
    /// downloaded so far, safe to read concurrently with [`Self::run`].
    pub(crate) fn progress_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.progress)
    }

    /// Runs the scheduler to completion: warms up every peer, then
    /// round-robins piece assignment until all pieces are downloaded.
    pub(crate) async fn run(&mut self) -> Result<()> {
        self.warm_up().await?;
        self.dispatch_loop().await
    }

    /// Launches `connect_and_prepare` on every peer and waits until at
    /// least one becomes ready, or the combined connect + handshake timeout
    /// elapses.
    async fn warm_up(&mut self) -> Result<()> {
        if self.peers.is_empty() {
            return Err(Error::NoPeersReady);
        }

        for peer in &self.peers {
            let _ = peer.cmd_chan.send(PeerCommand::Connect);
        }

        let deadline = Instant::now()
            + self.conf.connect_timeout
            + self.conf.handshake_timeout;
        loop {
            for peer in &self.peers {
                if peer.status.lock().await.ready {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::NoPeersReady);
            }
            tokio::time::delay_for(Duration::from_millis(200)).await;
        }
    }

    /// The main round-robin dispatch loop (§4.2 phase 2).
    async fn dispatch_loop(&mut self) -> Result<()> {
        let piece_count = self.pieces.len();
        let total = piece_count;
        let mut completed = self
            .statuses
            .iter()
            .filter(|s| **s == PieceStatus::Downloaded)
            .count();
        self.progress.store(completed, Ordering::Relaxed);

        let (done_chan, mut done_port) =
            mpsc::unbounded_channel::<(PieceIndex, Result<Vec<u8>>)>();

        let mut piece_cursor = 0usize;
        let mut peer_cursor = 0usize;
        let mut ticker = tokio::time::interval(self.conf.scheduler_tick);

        while completed < total {
            // drain any downloads that finished since the last tick without
            // blocking the dispatch loop on them
            while let Ok((index, result)) = done_port.try_recv() {
                match result {
                    Ok(_) => {
                        self.statuses[index] = PieceStatus::Downloaded;
                        completed += 1;
                        self.progress.store(completed, Ordering::Relaxed);
                        log::info!(
                            "Downloaded piece {} ({}/{})",
                            index,
                            completed,
                            total
                        );
                    }
                    Err(e) => {
                        log::info!("Piece {} download failed: {}", index, e);
                        self.statuses[index] = PieceStatus::Failed;
                    }
                }
            }
            if completed >= total {
                break;
            }

            ticker.tick().await;

            if matches!(
                self.statuses[piece_cursor],
                PieceStatus::Downloaded | PieceStatus::Requested
            ) {
                // already spoken for; skip it without consuming a peer turn,
                // mirroring `continue` in the reference `Download` loop.
                piece_cursor = (piece_cursor + 1) % piece_count;
            } else {
                let peer = &self.peers[peer_cursor];
                let snapshot = peer.status.lock().await.clone();
                if snapshot.free && snapshot.has_piece(piece_cursor) {
                    self.statuses[piece_cursor] = PieceStatus::Requested;
                    let piece = Arc::clone(&self.pieces[piece_cursor]);
                    let (reply, reply_port) = oneshot::channel();
                    if peer
                        .cmd_chan
                        .send(PeerCommand::Download(piece, reply))
                        .is_ok()
                    {
                        let done_chan = done_chan.clone();
                        let index = piece_cursor;
                        task::spawn(async move {
                            let result = reply_port
                                .await
                                .unwrap_or(Err(Error::PeerDisconnected));
                            let _ = done_chan.send((index, result));
                        });
                    } else {
                        self.statuses[piece_cursor] = PieceStatus::Failed;
                    }
                    piece_cursor = (piece_cursor + 1) % piece_count;
                } else if !snapshot.alive {
                    log::info!("Reconnecting to peer {}", peer.addr);
                    let _ = peer.cmd_chan.send(PeerCommand::Connect);
                }

                peer_cursor = (peer_cursor + 1) % self.peers.len();
            }
        }

        for peer in &self.peers {
            let _ = peer.cmd_chan.send(PeerCommand::Shutdown);
        }

        Ok(())
    }
}
