//! The crate-wide error type and the kinds of failure the engine can
//! surface, per the taxonomy in the design document: `Config`, `Tracker`,
//! `Connect`, `Handshake`, `Protocol`, `Choked`, `PeerDisconnected`,
//! `HashMismatch`, `DownloadFailed`, and `Io`.

use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The single error type returned by every fallible operation in the
/// engine.
#[derive(Debug)]
pub enum Error {
    /// The `.torrent` file couldn't be read, or its metainfo is malformed.
    InvalidMetainfo(String),
    /// No announce URL scheme we support (only http(s) and udp are).
    UnsupportedAnnounceScheme(String),
    /// The tracker request failed at the network layer, returned a non-OK
    /// response, sent a malformed body, or reported a `failure reason`.
    Tracker(String),
    /// Dialing the peer failed or timed out.
    Connect(std::io::Error),
    /// Connecting to the peer timed out.
    ConnectTimeout,
    /// The peer's handshake was malformed or its info hash didn't match
    /// ours.
    InvalidHandshake,
    /// We didn't receive a usable handshake/bitfield/unchoke within the
    /// configured timeout.
    HandshakeTimeout,
    /// A framing or message-level protocol violation: oversize frame,
    /// invalid message id, malformed bitfield, or a `piece` message that
    /// doesn't match the outstanding request.
    Protocol(String),
    /// The peer choked us while we were downloading a piece from it.
    Choked,
    /// The peer's connection closed unexpectedly.
    PeerDisconnected,
    /// The assembled piece's bytes didn't hash to the expected value.
    HashMismatch,
    /// Too many consecutive block errors occurred while downloading a
    /// piece from one peer.
    DownloadFailed,
    /// An index outside the torrent's piece or file count was used.
    InvalidPieceIndex,
    /// No torrent is registered under the given id.
    InvalidTorrentId,
    /// A filesystem operation failed while writing or creating a file.
    Io(std::io::Error),
    /// No peer from the tracker's list ever became ready.
    NoPeersReady,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidMetainfo(msg) => {
                write!(f, "invalid torrent metainfo: {}", msg)
            }
            Error::UnsupportedAnnounceScheme(scheme) => {
                write!(f, "unsupported announce protocol: {}", scheme)
            }
            Error::Tracker(msg) => write!(f, "tracker error: {}", msg),
            Error::Connect(e) => write!(f, "connect error: {}", e),
            Error::ConnectTimeout => write!(f, "connect timed out"),
            Error::InvalidHandshake => write!(f, "invalid peer handshake"),
            Error::HandshakeTimeout => {
                write!(f, "timed out waiting for bitfield and unchoke")
            }
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::Choked => write!(f, "peer choked us mid-download"),
            Error::PeerDisconnected => write!(f, "peer disconnected"),
            Error::HashMismatch => {
                write!(f, "piece hash did not match expected value")
            }
            Error::DownloadFailed => {
                write!(f, "block error threshold exceeded")
            }
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
            Error::InvalidTorrentId => write!(f, "invalid torrent id"),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::NoPeersReady => {
                write!(f, "no peer ever became ready to download from")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::InvalidMetainfo(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Tracker(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        // the only way sending on one of our internal channels fails is if
        // the receiving task has already gone away, which for our purposes
        // is equivalent to the peer/disk task having disconnected
        Error::PeerDisconnected
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        // the sender was dropped without a reply, which only happens if the
        // disk task died before answering
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk task terminated without replying",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_inner_io_error() {
        let io_err =
            std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err = Error::from(io_err);
        assert!(format!("{}", err).contains("nope"));
    }
}
