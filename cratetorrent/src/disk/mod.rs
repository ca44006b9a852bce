//! The disk IO actor: a single background task that owns every torrent's
//! open file handles and performs the positional writes described in §4.4.
//!
//! Piece integrity is verified by the peer session before the piece ever
//! reaches this module (§4.1.1 step 4); the writer's only job is to place
//! already-verified bytes at the right offsets in the right files.
//!
//! Both commands are request/response: the caller awaits the outcome on a
//! oneshot channel, since a peer session must know a piece write succeeded
//! before it marks the piece `Downloaded` (§4.1.1 step 6).

mod io;

use tokio::{
    sync::{mpsc, oneshot},
    task,
};

use crate::{
    error::{Error, Result},
    storage_info::StorageInfo,
    PieceIndex, TorrentId,
};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Commands the rest of the engine sends to the disk task.
pub(crate) enum Command {
    /// Registers a new torrent, creating its files (and parent
    /// directories) up front.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        result: oneshot::Sender<Result<()>>,
    },
    /// Writes an already hash-verified piece to every file it overlaps.
    WritePiece {
        id: TorrentId,
        index: PieceIndex,
        data: Vec<u8>,
        result: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// A handle to the disk IO task, used to send it commands and await their
/// results.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
}

impl DiskHandle {
    /// Spawns the disk IO task and returns a handle to it.
    pub(crate) fn spawn() -> Result<Self> {
        let (mut disk, cmd_chan) = io::Disk::new()?;
        task::spawn(async move {
            disk.start().await;
        });
        Ok(Self { cmd_chan })
    }

    pub(crate) async fn allocate_new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
    ) -> Result<()> {
        let (result, response) = oneshot::channel();
        self.cmd_chan
            .send(Command::NewTorrent { id, info, result })
            .map_err(Error::from)?;
        response.await.map_err(Error::from)?
    }

    pub(crate) async fn write_piece(
        &self,
        id: TorrentId,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        let (result, response) = oneshot::channel();
        self.cmd_chan
            .send(Command::WritePiece {
                id,
                index,
                data,
                result,
            })
            .map_err(Error::from)?;
        response.await.map_err(Error::from)?
    }

    /// Tells the disk task to stop its event loop, once all commands
    /// already queued ahead of this one have been processed.
    pub(crate) fn shutdown(&self) -> Result<()> {
        self.cmd_chan.send(Command::Shutdown).map_err(Error::from)
    }
}
