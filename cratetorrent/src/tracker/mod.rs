//! The tracker client: given a torrent and our identity, contacts the
//! announce URL and returns a list of candidate peers (§6).
//!
//! Both the HTTP/HTTPS and UDP (BEP-15) flavors are supported, chosen by
//! the announce URL's scheme. The reannounce interval the tracker reports
//! is parsed and returned but, per the open question decided in §13 of the
//! design document, never acted upon: the core treats the initial peer
//! list as sufficient for the lifetime of the download.

mod http;
mod udp;

use std::{collections::HashSet, net::SocketAddr, time::Duration};

use url::Url;

use crate::{
    error::{Error, Result},
    identity::ClientIdentity,
    metainfo::Metainfo,
};

/// The result of a single tracker announce.
pub(crate) struct AnnounceResponse {
    /// The peers the tracker returned, deduplicated by endpoint.
    pub peers: Vec<SocketAddr>,
    /// The reannounce interval the tracker recommended, if any. Recorded
    /// for completeness but not acted on (see module docs).
    pub interval: Option<Duration>,
}

/// Announces to the torrent's tracker and returns its peer list.
pub(crate) async fn announce(
    metainfo: &Metainfo,
    identity: &ClientIdentity,
) -> Result<AnnounceResponse> {
    let url = Url::parse(&metainfo.announce).map_err(|e| {
        Error::Tracker(format!("invalid announce url: {}", e))
    })?;

    let mut response = match url.scheme() {
        "http" | "https" => http::announce(&url, metainfo, identity).await?,
        "udp" => udp::announce(&url, metainfo, identity).await?,
        scheme => {
            return Err(Error::UnsupportedAnnounceScheme(scheme.to_string()))
        }
    };

    dedup_peers(&mut response.peers);

    Ok(response)
}

/// Deduplicates the peer list by (IP, port), per the open question decided
/// in the design document.
fn dedup_peers(peers: &mut Vec<SocketAddr>) {
    let mut seen = HashSet::with_capacity(peers.len());
    peers.retain(|addr| seen.insert(*addr));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_peers_removes_repeated_endpoints() {
        let a: SocketAddr = "1.2.3.4:6881".parse().unwrap();
        let b: SocketAddr = "1.2.3.4:6882".parse().unwrap();
        let mut peers = vec![a, b, a, a, b];
        dedup_peers(&mut peers);
        assert_eq!(peers.len(), 2);
        assert!(peers.contains(&a));
        assert!(peers.contains(&b));
    }
}
