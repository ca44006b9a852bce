//! A single peer session: owns one TCP connection, drives the peer-wire
//! handshake and availability exchange, and executes sequential, one
//! block-at-a-time piece downloads (§4.1).

mod codec;

use std::{net::SocketAddr, time::Instant};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time};
use tokio_util::codec::{Framed, FramedParts};

use codec::{
    Handshake, HandshakeCodec, Message, MessageId, PeerCodec, PROTOCOL_STRING,
};

use crate::{
    conf::TorrentConf,
    disk::DiskHandle,
    error::{Error, Result},
    identity::ClientIdentity,
    piece::Piece,
    Bitfield, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

type PeerStream = Framed<TcpStream, PeerCodec>;

/// At any given time, a peer session is in one of these states (§4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    New,
    Connecting,
    Handshaking,
    AwaitingBitfield,
    Ready,
    Downloading,
    Closed,
}

impl Default for State {
    fn default() -> Self {
        Self::New
    }
}

/// Owns one outbound TCP connection to a peer and implements just enough of
/// the peer-wire protocol to download pieces from it.
pub(crate) struct PeerSession {
    addr: SocketAddr,
    info_hash: Sha1Hash,
    identity: ClientIdentity,
    conf: TorrentConf,
    torrent_id: TorrentId,
    piece_count: usize,
    disk: DiskHandle,

    state: State,
    /// Empty until the peer's availability becomes known (either from an
    /// explicit bitfield message or the first `have`).
    bitfield: Bitfield,
    /// True until the peer chokes us; choked sessions may not request
    /// blocks.
    choked: bool,
    /// Derived from the TCP connection's health; cleared on any
    /// connection-level error.
    alive: bool,
    /// True while a `download_piece` call is in flight on this session.
    downloading: bool,
    /// Set once the handshake completes.
    peer_id: Option<PeerId>,
    /// The framed, post-handshake connection. `None` until
    /// `connect_and_prepare` succeeds.
    stream: Option<PeerStream>,
    /// When we last sent something to the peer, for proactive keep-alives
    /// (§9 open question, resolved: yes, every `conf.keepalive_interval`).
    last_sent_at: Instant,
}

impl PeerSession {
    pub(crate) fn new(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        identity: ClientIdentity,
        conf: TorrentConf,
        torrent_id: TorrentId,
        piece_count: usize,
        disk: DiskHandle,
    ) -> Self {
        Self {
            addr,
            info_hash,
            identity,
            conf,
            torrent_id,
            piece_count,
            disk,
            state: State::default(),
            bitfield: Bitfield::new(),
            choked: true,
            alive: false,
            downloading: false,
            peer_id: None,
            stream: None,
            last_sent_at: Instant::now(),
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// How long this session may go without sending anything before it
    /// should proactively send a keep-alive (§9 open question, resolved:
    /// yes).
    pub(crate) fn keepalive_interval(&self) -> std::time::Duration {
        self.conf.keepalive_interval
    }

    /// A snapshot of the peer's currently known piece availability.
    pub(crate) fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// True iff the session is `Ready` and its bitfield covers every piece.
    pub(crate) fn is_ready(&self) -> bool {
        self.state == State::Ready && self.bitfield.len() == self.piece_count
    }

    /// True iff the TCP connection is (to our knowledge) still usable.
    pub(crate) fn is_alive(&self) -> bool {
        self.alive
    }

    /// True iff no `download_piece` call is currently in flight.
    pub(crate) fn is_free(&self) -> bool {
        !self.downloading
    }

    /// True iff the session is ready and the peer has advertised the given
    /// piece.
    pub(crate) fn has_piece(&self, index: PieceIndex) -> bool {
        self.is_ready()
            && index < self.bitfield.len()
            && self.bitfield[index]
    }

    /// Drives the session from `New` through the handshake and availability
    /// exchange to `Ready` (§4.1 state machine).
    pub(crate) async fn connect_and_prepare(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.state = State::Connecting;
        let socket =
            time::timeout(self.conf.connect_timeout, TcpStream::connect(self.addr))
                .await
                .map_err(|_| Error::ConnectTimeout)?
                .map_err(Error::Connect)?;
        self.alive = true;
        log::info!("Connected to peer {}", self.addr);

        self.state = State::Handshaking;
        let mut handshake_io = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(self.info_hash, self.identity.peer_id);
        log::debug!("Sending handshake to peer {}", self.addr);
        handshake_io.send(handshake).await?;

        let peer_handshake = time::timeout(
            self.conf.handshake_timeout,
            handshake_io.next(),
        )
        .await
        .map_err(|_| {
            self.alive = false;
            Error::HandshakeTimeout
        })?
        .ok_or_else(|| {
            self.alive = false;
            Error::PeerDisconnected
        })??;
        debug_assert_eq!(
            &peer_handshake.prot[..],
            PROTOCOL_STRING.as_bytes()
        );

        if peer_handshake.info_hash != self.info_hash {
            log::info!("Peer {} handshake has mismatched info hash", self.addr);
            self.alive = false;
            return Err(Error::InvalidHandshake);
        }
        self.peer_id = Some(peer_handshake.peer_id);

        // switch to the message codec, carrying over any bytes the peer may
        // have already sent past the handshake
        let old_parts = handshake_io.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut stream = Framed::from_parts(new_parts);

        self.state = State::AwaitingBitfield;
        log::debug!("Sending interested to peer {}", self.addr);
        stream.send(Message::Interested).await?;
        self.last_sent_at = Instant::now();

        let deadline = Instant::now() + self.conf.handshake_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.alive = false;
                return Err(Error::HandshakeTimeout);
            }

            let msg = time::timeout(remaining, stream.next())
                .await
                .map_err(|_| Error::HandshakeTimeout)?
                .ok_or(Error::PeerDisconnected)??;

            match msg {
                Message::Bitfield(mut bitfield) => {
                    if bitfield.len() < self.piece_count {
                        self.alive = false;
                        return Err(Error::Protocol(
                            "bitfield shorter than piece count".into(),
                        ));
                    }
                    if bitfield[self.piece_count..].iter().any(|b| *b) {
                        self.alive = false;
                        return Err(Error::Protocol(
                            "bitfield has set bits beyond piece count".into(),
                        ));
                    }
                    bitfield.truncate(self.piece_count);
                    self.bitfield = bitfield;
                }
                Message::Have { piece_index } => {
                    self.record_have(piece_index)?;
                }
                Message::Unchoke => self.choked = false,
                Message::Choke => self.choked = true,
                Message::KeepAlive => {}
                _ => {
                    // anything else this early is simply ignored; we're not
                    // required to support it yet
                }
            }

            if !self.bitfield.is_empty() && !self.choked {
                break;
            }
        }

        self.stream = Some(stream);
        self.state = State::Ready;
        log::info!("Peer {} session ready", self.addr);
        Ok(())
    }

    /// Records a `have` message, lazily allocating the bitfield if this is
    /// the first piece-availability information we've received.
    fn record_have(&mut self, piece_index: u32) -> Result<()> {
        let index = piece_index as usize;
        if index >= self.piece_count {
            self.alive = false;
            return Err(Error::Protocol("have index out of range".into()));
        }
        if self.bitfield.is_empty() {
            self.bitfield =
                std::iter::repeat(false).take(self.piece_count).collect();
        }
        self.bitfield.set(index, true);
        Ok(())
    }

    /// If we haven't sent anything in a while, sends a keep-alive so the
    /// peer doesn't time us out. Meant to be polled periodically by the
    /// scheduler for free, ready sessions.
    pub(crate) async fn send_keepalive_if_idle(&mut self) -> Result<()> {
        if self.last_sent_at.elapsed() < self.conf.keepalive_interval {
            return Ok(());
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.send(Message::KeepAlive).await?;
            self.last_sent_at = Instant::now();
        }
        Ok(())
    }

    /// Downloads a single piece from this peer, sequentially requesting one
    /// block at a time (§4.1.1). On success, the bytes are both written to
    /// disk and returned.
    pub(crate) async fn download_piece(
        &mut self,
        piece: &Piece,
    ) -> Result<Vec<u8>> {
        debug_assert!(self.is_ready());
        debug_assert!(self.has_piece(piece.index));
        debug_assert!(self.is_free());

        self.downloading = true;
        self.state = State::Downloading;
        let result = self.download_piece_inner(piece).await;
        self.downloading = false;
        self.state = if self.alive {
            State::Ready
        } else {
            State::Closed
        };
        result
    }

    async fn download_piece_inner(&mut self, piece: &Piece) -> Result<Vec<u8>> {
        let max_errors = self.conf.max_block_errors;
        let block_timeout = self.conf.block_timeout;
        let mut buf = Vec::with_capacity(piece.len as usize);

        let mut block_cursor = 0;
        while block_cursor < piece.blocks.len() {
            let block = piece.blocks[block_cursor];
            let mut error_count = 0u32;

            // Retry the request send itself on transient write errors,
            // folding failures into the same per-block error budget the
            // receive loop below uses (§4.1.1: write errors count as block
            // errors too, not just read errors).
            loop {
                let stream = self.stream.as_mut().ok_or_else(|| {
                    self.alive = false;
                    Error::PeerDisconnected
                })?;
                match stream.send(Message::Request(block)).await {
                    Ok(()) => break,
                    Err(_) => {
                        error_count += 1;
                        if error_count > max_errors {
                            self.alive = false;
                            return Err(Error::DownloadFailed);
                        }
                    }
                }
            }
            self.last_sent_at = Instant::now();

            loop {
                let msg_result = {
                    let stream = self.stream.as_mut().unwrap();
                    time::timeout(block_timeout, stream.next()).await
                };

                let msg = match msg_result {
                    Ok(Some(Ok(msg))) => msg,
                    Ok(Some(Err(_))) => {
                        error_count += 1;
                        if error_count > max_errors {
                            self.alive = false;
                            return Err(Error::DownloadFailed);
                        }
                        continue;
                    }
                    Ok(None) => {
                        self.alive = false;
                        return Err(Error::PeerDisconnected);
                    }
                    Err(_timeout) => {
                        error_count += 1;
                        if error_count > max_errors {
                            self.alive = false;
                            return Err(Error::DownloadFailed);
                        }
                        continue;
                    }
                };

                match msg {
                    Message::Piece {
                        piece_index,
                        offset,
                        data,
                    } if piece_index as usize == piece.index
                        && offset == block.offset
                        && data.len() == block.len as usize =>
                    {
                        buf.extend_from_slice(&data);
                        block_cursor += 1;
                        break;
                    }
                    Message::Choke => {
                        self.choked = true;
                        return Err(Error::Choked);
                    }
                    Message::Have { piece_index } => {
                        // an out of range have during a download is a
                        // protocol violation, but we don't want to abort an
                        // otherwise healthy piece download over it
                        let index = piece_index as usize;
                        if index < self.piece_count {
                            if self.bitfield.is_empty() {
                                self.bitfield = std::iter::repeat(false)
                                    .take(self.piece_count)
                                    .collect();
                            }
                            self.bitfield.set(index, true);
                        }
                    }
                    Message::KeepAlive => {}
                    _ => {
                        error_count += 1;
                        if error_count > max_errors {
                            self.alive = false;
                            return Err(Error::DownloadFailed);
                        }
                    }
                }
            }
        }

        if !piece.verify(&buf) {
            log::warn!(
                "Piece {} failed hash verification from peer {} (expected {})",
                piece.index,
                self.addr,
                hex::encode(&piece.hash)
            );
            return Err(Error::HashMismatch);
        }

        self.disk
            .write_piece(self.torrent_id, piece.index, buf.clone())
            .await
            .map_err(|_| Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "failed to write piece to disk",
            )))?;

        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conf::TorrentConf, identity::ClientIdentity};

    fn test_session(piece_count: usize) -> PeerSession {
        PeerSession::new(
            "127.0.0.1:6881".parse().unwrap(),
            [0u8; 20],
            ClientIdentity::generate(),
            TorrentConf::new("/tmp"),
            0,
            piece_count,
            // this handle is never used by the tests below, which don't
            // exercise disk IO
            DiskHandle::spawn().unwrap(),
        )
    }

    // `DiskHandle::spawn` requires a running tokio reactor, hence these are
    // run as tokio tests even though they don't await anything themselves.

    #[tokio::test]
    async fn fresh_session_is_not_ready_or_alive() {
        let session = test_session(10);
        assert!(!session.is_ready());
        assert!(!session.is_alive());
        assert!(session.is_free());
    }

    #[tokio::test]
    async fn record_have_sets_bit_and_rejects_out_of_range() {
        let mut session = test_session(4);
        session.record_have(2).unwrap();
        assert_eq!(session.bitfield.len(), 4);
        assert!(session.bitfield[2]);
        assert!(!session.bitfield[0]);

        assert!(session.record_have(4).is_err());
    }

    #[tokio::test]
    async fn has_piece_is_false_until_ready() {
        let mut session = test_session(4);
        session.record_have(1).unwrap();
        // not ready yet: state is still `New`
        assert!(!session.has_piece(1));
    }
}
