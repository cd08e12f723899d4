use std::{fmt, io};

use thiserror::Error;

use crate::bitfield::BitVector;
use crate::util::force_string;

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_BASE_LENGTH: usize = 49; // pstrlen + reserved + info hash + peer id
pub const MAX_FRAME_LENGTH: usize = 1 << 21; // larger than any bitfield or block we would accept

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;

#[derive(Eq, PartialEq, Hash, Clone, Copy, Debug)]
pub struct BlockRequest {
    pub piece_idx: u32,
    pub block_begin: u32,
    pub data_len: u32,
}

impl fmt::Display for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "piece idx: {}, begin: {}, length: {}",
            self.piece_idx, self.block_begin, self.data_len
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32), // piece index
    Bitfield(BitVector),
    Request(BlockRequest),
    Piece(u32, u32, Vec<u8>), // index, begin, block of data
    Cancel(BlockRequest),
    Port(u16), // DHT port, accepted and ignored
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep-alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have(piece_idx) => write!(f, "have piece id {piece_idx}"),
            Message::Bitfield(bitfield) => write!(f, "bitfield have {bitfield}"),
            Message::Request(block_request) => write!(f, "request: {block_request}"),
            Message::Piece(piece_idx, begin, data) => write!(
                f,
                "piece: piece idx: {piece_idx}, begin: {begin}, data len: {}",
                data.len()
            ),
            Message::Cancel(block_request) => write!(f, "cancel: {block_request}"),
            Message::Port(p) => write!(f, "port {p}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid {message} length: expected {expected} bytes, got {actual}")]
    Framing {
        message: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),
    #[error("bitfield has bits set beyond the number of pieces")]
    InvalidBitfield,
    #[error("unknown message type id: {0}")]
    UnknownMessageType(u8),
}

/// Reasons a single peer connection is torn down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("protocol violation: {0}")]
    Violation(String),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("timed out {0}")]
    Timeout(&'static str),
}

impl ProtocolError {
    pub fn violation(message: impl Into<String>) -> Self {
        ProtocolError::Violation(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub pstr: Vec<u8>,
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            pstr: PROTOCOL_STRING.to_vec(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_BASE_LENGTH + self.pstr.len());
        buf.push(self.pstr.len() as u8);
        buf.extend_from_slice(&self.pstr);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let pstr_len = match buf.first() {
            Some(l) => *l as usize,
            None => {
                return Err(WireError::Framing {
                    message: "handshake",
                    expected: HANDSHAKE_BASE_LENGTH,
                    actual: 0,
                })
            }
        };
        let expected = HANDSHAKE_BASE_LENGTH + pstr_len;
        if buf.len() != expected {
            return Err(WireError::Framing {
                message: "handshake",
                expected,
                actual: buf.len(),
            });
        }
        let mut reserved = [0; 8];
        let mut info_hash = [0; 20];
        let mut peer_id = [0; 20];
        let mut at = 1 + pstr_len;
        reserved.copy_from_slice(&buf[at..at + 8]);
        at += 8;
        info_hash.copy_from_slice(&buf[at..at + 20]);
        at += 20;
        peer_id.copy_from_slice(&buf[at..at + 20]);
        Ok(Handshake {
            pstr: buf[1..1 + pstr_len].to_vec(),
            reserved,
            info_hash,
            peer_id,
        })
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "protocol: {}, info_hash: {}, peer_id: {}, reserved: {:?}",
            force_string(&self.pstr),
            hex::encode(self.info_hash),
            force_string(&self.peer_id),
            self.reserved
        )
    }
}

/// Encodes a message into a full frame, length prefix included.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut payload = Vec::new();
    match message {
        Message::KeepAlive => {}
        Message::Choke => payload.push(ID_CHOKE),
        Message::Unchoke => payload.push(ID_UNCHOKE),
        Message::Interested => payload.push(ID_INTERESTED),
        Message::NotInterested => payload.push(ID_NOT_INTERESTED),
        Message::Have(piece_idx) => {
            payload.push(ID_HAVE);
            payload.extend_from_slice(&piece_idx.to_be_bytes());
        }
        Message::Bitfield(bitfield) => {
            payload.push(ID_BITFIELD);
            payload.extend_from_slice(bitfield.as_bytes());
        }
        Message::Request(block_request) => {
            payload.push(ID_REQUEST);
            push_block_request(&mut payload, block_request);
        }
        Message::Piece(piece_idx, begin, block) => {
            payload.push(ID_PIECE);
            payload.extend_from_slice(&piece_idx.to_be_bytes());
            payload.extend_from_slice(&begin.to_be_bytes());
            payload.extend_from_slice(block);
        }
        Message::Cancel(block_request) => {
            payload.push(ID_CANCEL);
            push_block_request(&mut payload, block_request);
        }
        Message::Port(port) => {
            payload.push(ID_PORT);
            payload.extend_from_slice(&port.to_be_bytes());
        }
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    buf
}

/// Decodes a full frame, length prefix included.
pub fn decode(frame: &[u8], num_pieces: usize) -> Result<Message, WireError> {
    if frame.len() < 4 {
        return Err(WireError::Framing {
            message: "frame",
            expected: 4,
            actual: frame.len(),
        });
    }
    let declared = be_u32(frame, 0) as usize;
    if declared != frame.len() - 4 {
        return Err(WireError::Framing {
            message: "frame",
            expected: declared + 4,
            actual: frame.len(),
        });
    }
    decode_payload(&frame[4..], num_pieces)
}

/// Decodes the bytes following the length prefix. An empty payload is a
/// keep-alive.
pub fn decode_payload(payload: &[u8], num_pieces: usize) -> Result<Message, WireError> {
    let Some((&id, body)) = payload.split_first() else {
        return Ok(Message::KeepAlive);
    };
    let check = |message: &'static str, expected: usize| {
        if payload.len() != expected {
            Err(WireError::Framing {
                message,
                expected,
                actual: payload.len(),
            })
        } else {
            Ok(())
        }
    };
    match id {
        ID_CHOKE => check("choke", 1).map(|_| Message::Choke),
        ID_UNCHOKE => check("unchoke", 1).map(|_| Message::Unchoke),
        ID_INTERESTED => check("interested", 1).map(|_| Message::Interested),
        ID_NOT_INTERESTED => check("not interested", 1).map(|_| Message::NotInterested),
        ID_HAVE => {
            check("have", 5)?;
            Ok(Message::Have(be_u32(body, 0)))
        }
        ID_BITFIELD => {
            check("bitfield", 1 + num_pieces.div_ceil(8))?;
            let bitfield =
                BitVector::from_bytes(body, num_pieces).map_err(|_| WireError::InvalidBitfield)?;
            Ok(Message::Bitfield(bitfield))
        }
        ID_REQUEST => {
            check("request", 13)?;
            Ok(Message::Request(read_block_request(body)))
        }
        ID_PIECE => {
            if payload.len() < 9 {
                return Err(WireError::Framing {
                    message: "piece",
                    expected: 9,
                    actual: payload.len(),
                });
            }
            Ok(Message::Piece(
                be_u32(body, 0),
                be_u32(body, 4),
                body[8..].to_vec(),
            ))
        }
        ID_CANCEL => {
            check("cancel", 13)?;
            Ok(Message::Cancel(read_block_request(body)))
        }
        ID_PORT => {
            check("port", 3)?;
            Ok(Message::Port(u16::from_be_bytes([body[0], body[1]])))
        }
        unknown => Err(WireError::UnknownMessageType(unknown)),
    }
}

fn push_block_request(buf: &mut Vec<u8>, block_request: &BlockRequest) {
    buf.extend_from_slice(&block_request.piece_idx.to_be_bytes());
    buf.extend_from_slice(&block_request.block_begin.to_be_bytes());
    buf.extend_from_slice(&block_request.data_len.to_be_bytes());
}

fn read_block_request(body: &[u8]) -> BlockRequest {
    BlockRequest {
        piece_idx: be_u32(body, 0),
        block_begin: be_u32(body, 4),
        data_len: be_u32(body, 8),
    }
}

// callers check the length beforehand
fn be_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(bytes)
}

#[trait_variant::make(Send)]
pub trait Protocol {
    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), ProtocolError>;
    async fn receive_handshake(&mut self) -> Result<Handshake, ProtocolError>;
}

#[trait_variant::make(Send)]
pub trait ProtocolReadHalf {
    async fn receive(&mut self, num_pieces: usize) -> Result<Message, ProtocolError>;
}

#[trait_variant::make(Send)]
pub trait ProtocolWriteHalf {
    async fn send(&mut self, message: &Message) -> Result<(), ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(piece_idx: u32, block_begin: u32, data_len: u32) -> BlockRequest {
        BlockRequest {
            piece_idx,
            block_begin,
            data_len,
        }
    }

    #[test]
    fn encodes_exact_layouts() {
        assert_eq!(encode(&Message::KeepAlive), vec![0, 0, 0, 0]);
        assert_eq!(encode(&Message::Unchoke), vec![0, 0, 0, 1, 1]);
        assert_eq!(encode(&Message::Have(258)), vec![0, 0, 0, 5, 4, 0, 0, 1, 2]);
        assert_eq!(
            encode(&Message::Request(block(1, 16384, 16384))),
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 64, 0, 0, 0, 64, 0]
        );
        assert_eq!(
            encode(&Message::Piece(0, 2, vec![9, 9])),
            vec![0, 0, 0, 11, 7, 0, 0, 0, 0, 0, 0, 0, 2, 9, 9]
        );
        assert_eq!(encode(&Message::Port(6881)), vec![0, 0, 0, 3, 9, 0x1a, 0xe1]);
    }

    #[test]
    fn every_variant_survives_a_frame() {
        let mut bitfield = BitVector::new(3);
        bitfield.set(2, true).unwrap();
        let messages = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(7),
            Message::Bitfield(bitfield),
            Message::Request(block(2, 0, 16384)),
            Message::Piece(2, 16384, vec![]),
            Message::Piece(2, 0, vec![1, 2, 3]),
            Message::Cancel(block(2, 0, 16384)),
            Message::Port(1),
        ];
        for message in messages {
            assert_eq!(decode(&encode(&message), 3).unwrap(), message);
        }
    }

    #[test]
    fn length_mismatch_is_framing_error() {
        assert_matches!(
            decode_payload(&[ID_HAVE, 0, 0, 1], 10),
            Err(WireError::Framing {
                message: "have",
                expected: 5,
                actual: 4
            })
        );
        assert_matches!(
            decode_payload(&[ID_CHOKE, 0], 10),
            Err(WireError::Framing { expected: 1, .. })
        );
        assert_matches!(
            decode_payload(&[ID_BITFIELD, 0], 10),
            Err(WireError::Framing {
                message: "bitfield",
                expected: 3,
                actual: 2
            })
        );
        assert_matches!(
            decode_payload(&[ID_PIECE, 0, 0, 0, 1], 10),
            Err(WireError::Framing { expected: 9, .. })
        );
        assert_matches!(
            decode(&[0, 0, 0, 5, ID_CHOKE], 10),
            Err(WireError::Framing { message: "frame", .. })
        );
    }

    #[test]
    fn bitfield_with_spare_bits_is_rejected() {
        assert_matches!(
            decode_payload(&[ID_BITFIELD, 0b0010_0000], 2),
            Err(WireError::InvalidBitfield)
        );
    }

    #[test]
    fn unknown_id_is_rejected() {
        assert_matches!(
            decode_payload(&[20, 0, 1], 10),
            Err(WireError::UnknownMessageType(20))
        );
    }

    #[test]
    fn handshake_layout() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let buf = handshake.encode();
        assert_eq!(buf.len(), 49 + 19);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL_STRING);
        assert_eq!(&buf[28..48], &[1; 20]);
        assert_eq!(Handshake::decode(&buf).unwrap(), handshake);
        assert_matches!(
            Handshake::decode(&buf[..60]),
            Err(WireError::Framing {
                expected: 68,
                actual: 60,
                ..
            })
        );
    }
}
