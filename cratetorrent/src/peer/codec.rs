//! The peer-wire protocol's framing: the one-off handshake and the
//! length-prefixed message stream that follows it (§4.1).

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PeerId, Sha1Hash, BLOCK_LEN,
};

/// The protocol string every handshake advertises.
pub(super) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// `length` (4) + `id` (1) + the largest payload we accept, a `piece`
/// message's `piece_index` (4) + `begin` (4) + up to `BLOCK_LEN` bytes.
const MAX_MSG_LEN: usize = 4 + 1 + 4 + 4 + BLOCK_LEN as usize;

/// The fixed-format message exchanged once, in both directions, before any
/// other peer-wire traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Handshake {
    /// Always `PROTOCOL_STRING`, verified on decode.
    pub prot: [u8; 19],
    /// Reserved extension bytes. Always zero; we don't support extensions.
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0u8; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// The wire length of a handshake: `1 + 19 + 8 + 20 + 20`.
const HANDSHAKE_LEN: usize = 68;

pub(super) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.len() < HANDSHAKE_LEN {
            buf.reserve(HANDSHAKE_LEN - buf.len());
            return Ok(None);
        }

        let pstrlen = buf[0];
        if pstrlen != 19 {
            return Err(Error::InvalidHandshake);
        }

        let mut buf = buf.split_to(HANDSHAKE_LEN);
        buf.advance(1);

        let mut prot = [0u8; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        buf.copy_to_slice(&mut reserved);

        let mut info_hash = [0u8; 20];
        buf.copy_to_slice(&mut info_hash);

        let mut peer_id = [0u8; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The message ids used by the core (§4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            9 => Ok(Self::Port),
            _ => Err(Error::Protocol(format!("invalid message id: {}", id))),
        }
    }
}

/// A single decoded peer-wire message.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    Port(u16),
}

impl Message {
    /// Returns the message's id, or `None` for keep-alive, which has none.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Piece { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
        }
    }
}

pub(super) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.reserve(4);
                buf.put_u32(0);
            }
            Message::Choke => encode_empty(buf, MessageId::Choke),
            Message::Unchoke => encode_empty(buf, MessageId::Unchoke),
            Message::Interested => encode_empty(buf, MessageId::Interested),
            Message::NotInterested => {
                encode_empty(buf, MessageId::NotInterested)
            }
            Message::Have { piece_index } => {
                buf.reserve(4 + 1 + 4);
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.reserve(4 + 1 + bytes.len());
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                buf.reserve(4 + 1 + 12);
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.reserve(4 + 1 + 8 + data.len());
                buf.put_u32(1 + 8 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                buf.reserve(4 + 1 + 12);
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Port(port) => {
                buf.reserve(4 + 1 + 2);
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

fn encode_empty(buf: &mut BytesMut, id: MessageId) {
    buf.reserve(4 + 1);
    buf.put_u32(1);
    buf.put_u8(id as u8);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if 4 + length > MAX_MSG_LEN {
            return Err(Error::Protocol(format!(
                "message length {} exceeds maximum",
                length
            )));
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let id = MessageId::try_from(buf[0])?;
        let mut payload = buf.split_to(length);
        payload.advance(1);

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload.len() != 4 {
                    return Err(Error::Protocol(
                        "malformed have message".into(),
                    ));
                }
                Message::Have {
                    piece_index: payload.get_u32(),
                }
            }
            MessageId::Bitfield => {
                let bytes = payload.to_vec();
                Message::Bitfield(Bitfield::from_vec(bytes))
            }
            MessageId::Request => {
                if payload.len() != 12 {
                    return Err(Error::Protocol(
                        "malformed request message".into(),
                    ));
                }
                Message::Request(BlockInfo {
                    piece_index: payload.get_u32() as usize,
                    offset: payload.get_u32(),
                    len: payload.get_u32(),
                })
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(Error::Protocol(
                        "malformed piece message".into(),
                    ));
                }
                let piece_index = payload.get_u32();
                let offset = payload.get_u32();
                Message::Piece {
                    piece_index,
                    offset,
                    data: payload.to_vec(),
                }
            }
            MessageId::Cancel => {
                if payload.len() != 12 {
                    return Err(Error::Protocol(
                        "malformed cancel message".into(),
                    ));
                }
                Message::Cancel(BlockInfo {
                    piece_index: payload.get_u32() as usize,
                    offset: payload.get_u32(),
                    len: payload.get_u32(),
                })
            }
            MessageId::Port => {
                if payload.len() != 2 {
                    return Err(Error::Protocol(
                        "malformed port message".into(),
                    ));
                }
                Message::Port(payload.get_u16())
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let info_hash = [1u8; 20];
        let peer_id = [2u8; 20];
        let handshake = Handshake::new(info_hash, peer_id);

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn handshake_rejects_wrong_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"not the bittorrent!");
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&[0u8; 20]);
        buf.put_slice(&[0u8; 20]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn keep_alive_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn bitfield_round_trips() {
        // §8 scenario 2: N=10, payload [0b10110000, 0b10000000].
        let mut bitfield = Bitfield::from_vec(vec![0b1011_0000, 0b1000_0000]);
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Bitfield(bitfield.clone()), &mut buf)
            .unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Message::Bitfield(decoded_bits) => {
                bitfield.truncate(10);
                let mut decoded_bits = decoded_bits;
                decoded_bits.truncate(10);
                assert_eq!(decoded_bits, bitfield);
            }
            _ => panic!("expected bitfield message"),
        }
    }

    #[test]
    fn request_round_trips() {
        let block = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Request(block));
    }

    #[test]
    fn piece_round_trips_and_preserves_index_and_offset() {
        let data = vec![7u8; 1000];
        let msg = Message::Piece {
            piece_index: 5,
            offset: 32768,
            data: data.clone(),
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Message::Piece {
                piece_index,
                offset,
                data: decoded_data,
            } => {
                assert_eq!(piece_index, 5);
                assert_eq!(offset, 32768);
                assert_eq!(decoded_data, data);
            }
            _ => panic!("expected piece message"),
        }
    }

    #[test]
    fn oversize_message_is_rejected() {
        let mut buf = BytesMut::new();
        // length field alone already exceeds MAX_MSG_LEN
        buf.put_u32(MAX_MSG_LEN as u32);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn partial_message_returns_none_until_complete() {
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 16384,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
    }
}
