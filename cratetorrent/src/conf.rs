//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::identity::ClientIdentity;

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. The client identity is freshly generated, per spec §3.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                identity: ClientIdentity::generate(),
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The process-wide client identity announced to trackers and peers.
    pub identity: ClientIdentity,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The max number of peers the scheduler will ever hold a session open
    /// to at once; if the tracker returns more candidates than this, the
    /// excess is simply not connected to.
    pub max_connected_peer_count: usize,

    /// Bounded timeout for establishing the TCP connection to a peer (§5).
    pub connect_timeout: Duration,

    /// Bounded timeout for the handshake + bitfield + unchoke wait after
    /// connecting (§4.1, default 50s).
    pub handshake_timeout: Duration,

    /// Bounded timeout for a single block read while downloading a piece.
    pub block_timeout: Duration,

    /// Maximum consecutive block errors tolerated before a piece download
    /// is aborted with `DownloadFailed` (§4.1.1).
    pub max_block_errors: u32,

    /// How long a peer session may go without sending anything before it
    /// proactively sends a keep-alive (§9 Open Questions, resolved: yes).
    pub keepalive_interval: Duration,

    /// How often the scheduler's dispatch loop ticks (§4.2, ~100ms
    /// nominal).
    pub scheduler_tick: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(50),
            block_timeout: Duration::from_secs(20),
            max_block_errors: 3,
            keepalive_interval: Duration::from_secs(90),
            scheduler_tick: Duration::from_millis(100),
        }
    }
}
