//! The HTTP(S) tracker protocol: a single GET request whose bencoded
//! response carries a compact peer list (§6).

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;
use url::Url;

use super::AnnounceResponse;
use crate::{
    error::{Error, Result},
    identity::ClientIdentity,
    metainfo::Metainfo,
};

/// The number of peers we ask the tracker for.
const NUM_WANT: u32 = 40;

pub(super) async fn announce(
    url: &Url,
    metainfo: &Metainfo,
    identity: &ClientIdentity,
) -> Result<AnnounceResponse> {
    let total_size = metainfo.structure.download_len();
    // `info_hash` and `peer_id` are arbitrary bytes, not necessarily valid
    // UTF-8, so they must be percent-encoded by hand rather than through
    // `url`'s (str-only) query pair builder.
    let info_hash = percent_encode(&metainfo.info_hash, NON_ALPHANUMERIC);
    let peer_id = percent_encode(&identity.peer_id, NON_ALPHANUMERIC);
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&\
         compact=1&event=started&ip={}&numwant={}",
        info_hash,
        peer_id,
        identity.listen_port,
        total_size,
        identity.local_ip,
        NUM_WANT,
    );
    let mut request_url = url.clone();
    request_url.set_query(Some(&query));

    log::debug!("Sending HTTP tracker announce to {}", request_url);
    let resp = reqwest::get(request_url.as_str()).await?;
    if !resp.status().is_success() {
        return Err(Error::Tracker(format!(
            "tracker responded with HTTP {}",
            resp.status()
        )));
    }
    let body = resp.bytes().await?;

    let decoded: Response = serde_bencode::from_bytes(&body).map_err(|e| {
        Error::Tracker(format!("malformed tracker response: {}", e))
    })?;

    if let Some(reason) = decoded.failure_reason {
        return Err(Error::Tracker(reason));
    }
    if let Some(warning) = &decoded.warning_message {
        log::warn!("Tracker warning: {}", warning);
    }

    let peers = decoded
        .peers
        .map(|bytes| parse_compact_peers(&bytes))
        .unwrap_or_default();

    Ok(AnnounceResponse {
        peers,
        interval: decoded
            .interval
            .map(|secs| Duration::from_secs(secs.max(0) as u64)),
    })
}

/// Parses a compact peer list: 6-byte records of 4-byte IPv4 address
/// followed by a 2-byte big-endian port (§6).
fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct Response {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    interval: Option<i64>,
    #[serde(rename = "min interval")]
    min_interval: Option<i64>,
    peers: Option<ByteBuf>,
}
