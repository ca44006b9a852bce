//! The UDP tracker protocol (BEP-15): a connect/announce round trip on the
//! announce host (§6).

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
    time::Duration,
};

use tokio::net::UdpSocket;
use url::Url;

use super::AnnounceResponse;
use crate::{
    error::{Error, Result},
    identity::ClientIdentity,
    metainfo::Metainfo,
};

/// The magic constant identifying a connect request, per BEP-15.
const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const EVENT_STARTED: u32 = 2;
const NUM_WANT: i32 = 40;

/// Bounded wait for each of the two round trips. The UDP tracker protocol
/// has no notion of a persistent connection, so a single timeout per
/// packet exchange is sufficient.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

pub(super) async fn announce(
    url: &Url,
    metainfo: &Metainfo,
    identity: &ClientIdentity,
) -> Result<AnnounceResponse> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Tracker("UDP announce url has no host".into()))?;
    let port = url
        .port()
        .ok_or_else(|| Error::Tracker("UDP announce url has no port".into()))?;
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Tracker(e.to_string()))?
        .next()
        .ok_or_else(|| {
            Error::Tracker(format!("could not resolve {}:{}", host, port))
        })?;

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| Error::Tracker(e.to_string()))?;

    let transaction_id = identity.next_transaction_id();
    let connection_id = connect(&socket, addr, transaction_id).await?;

    let transaction_id = identity.next_transaction_id();
    announce_request(
        &socket,
        addr,
        connection_id,
        transaction_id,
        metainfo,
        identity,
    )
    .await
}

/// Sends the connect packet and returns the `connection_id` needed for the
/// announce packet.
async fn connect(
    socket: &UdpSocket,
    addr: SocketAddr,
    transaction_id: u32,
) -> Result<u64> {
    let mut packet = Vec::with_capacity(16);
    packet.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());

    socket
        .send_to(&packet, addr)
        .await
        .map_err(|e| Error::Tracker(e.to_string()))?;

    let mut resp = [0u8; 16];
    let n = recv_with_timeout(socket, &mut resp).await?;
    if n < 16 {
        return Err(Error::Tracker(
            "UDP connect response shorter than 16 bytes".into(),
        ));
    }

    let action = u32::from_be_bytes(resp[0..4].try_into().unwrap());
    let resp_transaction_id =
        u32::from_be_bytes(resp[4..8].try_into().unwrap());
    if action != ACTION_CONNECT || resp_transaction_id != transaction_id {
        return Err(Error::Tracker(
            "UDP connect response action or transaction id mismatch".into(),
        ));
    }

    Ok(u64::from_be_bytes(resp[8..16].try_into().unwrap()))
}

/// Sends the announce packet and parses the peer list out of the response.
async fn announce_request(
    socket: &UdpSocket,
    addr: SocketAddr,
    connection_id: u64,
    transaction_id: u32,
    metainfo: &Metainfo,
    identity: &ClientIdentity,
) -> Result<AnnounceResponse> {
    let total_size = metainfo.structure.download_len();
    let ip: u32 = match identity.local_ip {
        IpAddr::V4(ip) => u32::from(ip),
        IpAddr::V6(_) => 0,
    };

    let mut packet = Vec::with_capacity(98);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&metainfo.info_hash);
    packet.extend_from_slice(&identity.peer_id);
    packet.extend_from_slice(&0u64.to_be_bytes()); // downloaded
    packet.extend_from_slice(&total_size.to_be_bytes()); // left
    packet.extend_from_slice(&0u64.to_be_bytes()); // uploaded
    packet.extend_from_slice(&EVENT_STARTED.to_be_bytes());
    packet.extend_from_slice(&ip.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes()); // key
    packet.extend_from_slice(&NUM_WANT.to_be_bytes());
    packet.extend_from_slice(&identity.listen_port.to_be_bytes());
    debug_assert_eq!(packet.len(), 98);

    socket
        .send_to(&packet, addr)
        .await
        .map_err(|e| Error::Tracker(e.to_string()))?;

    let mut resp = [0u8; 20 + NUM_WANT as usize * 6];
    let n = recv_with_timeout(socket, &mut resp).await?;
    if n < 20 {
        return Err(Error::Tracker(
            "UDP announce response shorter than 20 bytes".into(),
        ));
    }
    let resp = &resp[..n];

    let action = u32::from_be_bytes(resp[0..4].try_into().unwrap());
    let resp_transaction_id =
        u32::from_be_bytes(resp[4..8].try_into().unwrap());
    if action != ACTION_ANNOUNCE || resp_transaction_id != transaction_id {
        return Err(Error::Tracker(
            "UDP announce response action or transaction id mismatch".into(),
        ));
    }
    let interval = u32::from_be_bytes(resp[8..12].try_into().unwrap());

    let peers = resp[20..]
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect();

    Ok(AnnounceResponse {
        peers,
        interval: Some(Duration::from_secs(interval as u64)),
    })
}

async fn recv_with_timeout(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> Result<usize> {
    tokio::time::timeout(RESPONSE_TIMEOUT, socket.recv_from(buf))
        .await
        .map_err(|_| Error::Tracker("UDP tracker request timed out".into()))?
        .map(|(n, _from)| n)
        .map_err(|e| Error::Tracker(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_packet_has_expected_layout() {
        let mut packet = Vec::with_capacity(16);
        packet.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        packet.extend_from_slice(&42u32.to_be_bytes());
        assert_eq!(packet.len(), 16);
        assert_eq!(
            u64::from_be_bytes(packet[0..8].try_into().unwrap()),
            PROTOCOL_ID
        );
        assert_eq!(
            u32::from_be_bytes(packet[8..12].try_into().unwrap()),
            0
        );
        assert_eq!(
            u32::from_be_bytes(packet[12..16].try_into().unwrap()),
            42
        );
    }
}
