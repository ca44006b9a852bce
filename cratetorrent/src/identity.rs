//! Process-wide client identity: peer id, local IP, listen port, and the
//! transaction id seed used by the UDP tracker protocol (§3).
//!
//! The identity is generated once, at engine startup, and treated as
//! read-only configuration from then on (§9 design notes: no ambient
//! globals, pass it explicitly to peer and tracker components).

use std::{
    cell::Cell,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use rand::Rng;

use crate::PeerId;

/// The prefix cratetorrent uses in its peer ids, following the Azureus-style
/// convention (`-<client><version>-` followed by random characters). See
/// <http://bittorrent.org/beps/bep_0020.html>.
const PEER_ID_PREFIX: &[u8] = b"-TC0001-";

/// The default listen port, used when no other port is specified. We don't
/// implement incoming connections (seeding is a non-goal), but trackers and
/// peers still expect a port number to be announced.
pub const DEFAULT_LISTEN_PORT: u16 = 6881;

/// A fallback IP used when local IP discovery fails, so that startup never
/// blocks indefinitely on network conditions outside our control.
const FALLBACK_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// The client's identity, generated once per process and shared read-only
/// with every tracker and peer component.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    /// Our 20 byte peer id, announced in both the tracker request and the
    /// peer handshake.
    pub peer_id: PeerId,
    /// Our best-effort local IP address, announced to the tracker.
    pub local_ip: IpAddr,
    /// The port we claim to be listening on.
    pub listen_port: u16,
    /// Seed for the `transaction_id` field of UDP tracker messages. Each
    /// UDP announce derives a fresh transaction id by wrapping-adding a
    /// per-call counter to this seed, so that concurrent announces (to
    /// different trackers) don't collide and repeated calls don't repeat.
    pub transaction_id_seed: u32,
    /// Advances on every [`Self::next_transaction_id`] call. `Cell` lets the
    /// method take `&self`, since the identity is shared read-only across
    /// tracker and peer components.
    transaction_id_counter: Cell<u32>,
}

impl ClientIdentity {
    /// Generates a new client identity: a random peer id, a best-effort
    /// local IP (resolved via an outbound UDP socket to a public address,
    /// exactly as the reference implementation does), the default listen
    /// port, and a random transaction id seed.
    pub fn generate() -> Self {
        Self {
            peer_id: generate_peer_id(),
            local_ip: discover_local_ip().unwrap_or(FALLBACK_IP),
            listen_port: DEFAULT_LISTEN_PORT,
            transaction_id_seed: rand::thread_rng().gen(),
            transaction_id_counter: Cell::new(0),
        }
    }

    /// Derives the next UDP tracker transaction id. Each call perturbs the
    /// seed so that repeated connect/announce round trips in the same
    /// process use distinct transaction ids.
    pub fn next_transaction_id(&self) -> u32 {
        let counter = self.transaction_id_counter.get();
        self.transaction_id_counter.set(counter.wrapping_add(1));
        self.transaction_id_seed.wrapping_add(counter)
    }
}

/// Generates a 20 byte peer id of the form `-TC0001-` followed by 12 random
/// ASCII letters, per spec §3.
fn generate_peer_id() -> PeerId {
    const LETTERS: &[u8] =
        b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut id = [0u8; 20];
    id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in &mut id[PEER_ID_PREFIX.len()..] {
        *byte = LETTERS[rng.gen_range(0..LETTERS.len())];
    }
    id
}

/// Resolves the client's local IP by dialing a UDP "connection" to a public
/// address and reading back the local socket address the OS picked for it.
/// No packets are actually sent for a UDP socket that's merely connected, so
/// this works offline too (it will just report whichever interface/address
/// would have been used).
fn discover_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    let public_addr: SocketAddr = "8.8.8.8:80".parse().ok()?;
    socket.connect(public_addr).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_expected_prefix_and_length() {
        let identity = ClientIdentity::generate();
        assert_eq!(identity.peer_id.len(), 20);
        assert_eq!(&identity.peer_id[..8], PEER_ID_PREFIX);
        for &b in &identity.peer_id[8..] {
            assert!(b.is_ascii_alphabetic());
        }
    }

    #[test]
    fn two_generated_identities_have_different_peer_ids() {
        let a = ClientIdentity::generate();
        let b = ClientIdentity::generate();
        // astronomically unlikely to collide given 52^12 possibilities
        assert_ne!(a.peer_id, b.peer_id);
    }
}
