use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Read;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ApplicationError;

/// The BitTorrent protocol identifier string
pub const PROTOCOL_STR: &str = "BitTorrent protocol";

/// Length of the full handshake message (always 68 bytes)
pub const HANDSHAKE_LEN: usize = 68;

/// Largest frame accepted from a peer. Leaves room for a 16 KiB block and
/// for the bitfield of a very large torrent.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024 + 13;

/// 20-byte string used to identify a client
pub type PeerId = [u8; 20];

/// Represents a BitTorrent handshake message.
///
/// A handshake is the first message sent in a connection and is always 68 bytes.
/// It identifies the torrent being requested (`info_hash`) and the client (`peer_id`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// SHA-1 hash of the info dictionary from the .torrent file
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }

    /// Encodes the handshake into a 68-byte array.
    ///
    /// This array can be written directly to a TCP stream.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STR.len() as u8;
        buf[1..1 + PROTOCOL_STR.len()].copy_from_slice(PROTOCOL_STR.as_bytes());
        // reserved bytes [20..28] stay zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Decodes the handshake at the start of `buf`.
    ///
    /// Returns `None` when fewer than 68 bytes are available or the buffer
    /// does not announce the BitTorrent protocol. Bytes past the handshake
    /// are not looked at.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HANDSHAKE_LEN {
            return None;
        }

        let pstrlen = buf[0] as usize;
        if pstrlen != PROTOCOL_STR.len() || &buf[1..1 + pstrlen] != PROTOCOL_STR.as_bytes() {
            return None;
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Some(Self { info_hash, peer_id })
    }
}

/// Represents a protocol message exchanged after the handshake.
///
/// These messages follow the BitTorrent peer wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// zero-length frame keeping an idle connection open
    KeepAlive,
    /// `choke` message: tells the peer it will not receive requests
    Choke,
    /// `unchoke` message: peer is allowed to request blocks
    Unchoke,
    /// `interested` message: client is interested in pieces from peer
    Interested,
    /// `not interested` message: client is not interested
    NotInterested,
    /// `have` message: peer has a specific piece
    Have(u32),
    /// `bitfield` message: bitmap of pieces the peer has
    Bitfield(Vec<u8>),
    /// `request` message: request a block of data
    Request { index: u32, begin: u32, length: u32 },
    /// `piece` message: sends a block of a piece
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// `cancel` message: cancels a previously sent request
    Cancel { index: u32, begin: u32, length: u32 },
    /// `port` message: the DHT port of the peer
    Port(u16),
}

impl Message {
    fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
            Message::Port(_) => Some(9),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 0,
            Message::Have(_) => 4,
            Message::Bitfield(bitfield) => bitfield.len(),
            Message::Request { .. } | Message::Cancel { .. } => 12,
            Message::Piece { block, .. } => 8 + block.len(),
            Message::Port(_) => 2,
        }
    }

    /// Serializes a `Message` into a byte vector for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Appends the framed message to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) {
        let Some(id) = self.id() else {
            dst.put_u32(0);
            return;
        };
        let payload_len = self.payload_len();
        dst.reserve(5 + payload_len);
        dst.put_u32((1 + payload_len) as u32);
        dst.put_u8(id);

        match self {
            Message::Have(index) => dst.put_u32(*index),
            Message::Bitfield(bitfield) => dst.extend_from_slice(bitfield),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.extend_from_slice(block);
            }
            Message::Port(port) => dst.put_u16(*port),
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
        }
    }

    /// Parses one complete frame, length prefix included.
    ///
    /// The frame must be exactly as long as its prefix declares and the
    /// payload must have the size its type requires.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ApplicationError> {
        let len = buf.read_u32::<BigEndian>().map_err(format_err)? as usize;

        if buf.len() != len {
            return Err(ApplicationError::FormatError(format!(
                "frame declares {} bytes but carries {}",
                len,
                buf.len()
            )));
        }

        if len == 0 {
            return Ok(Message::KeepAlive);
        }

        let id = buf.read_u8().map_err(format_err)?;
        let payload_len = len - 1;

        let expect = |want: usize, name: &str| {
            if payload_len == want {
                Ok(())
            } else {
                Err(ApplicationError::FormatError(format!(
                    "invalid {} message length {}",
                    name, payload_len
                )))
            }
        };

        let message = match id {
            0 => expect(0, "choke").map(|_| Message::Choke)?,
            1 => expect(0, "unchoke").map(|_| Message::Unchoke)?,
            2 => expect(0, "interested").map(|_| Message::Interested)?,
            3 => expect(0, "not interested").map(|_| Message::NotInterested)?,
            4 => {
                expect(4, "have")?;
                Message::Have(buf.read_u32::<BigEndian>().map_err(format_err)?)
            }
            5 => {
                let mut bitfield = vec![0u8; payload_len];
                buf.read_exact(&mut bitfield).map_err(format_err)?;
                Message::Bitfield(bitfield)
            }
            6 | 8 => {
                expect(12, if id == 6 { "request" } else { "cancel" })?;
                let index = buf.read_u32::<BigEndian>().map_err(format_err)?;
                let begin = buf.read_u32::<BigEndian>().map_err(format_err)?;
                let length = buf.read_u32::<BigEndian>().map_err(format_err)?;
                if id == 6 {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            7 => {
                if payload_len < 8 {
                    return Err(ApplicationError::FormatError(
                        "invalid piece message length".into(),
                    ));
                }
                let index = buf.read_u32::<BigEndian>().map_err(format_err)?;
                let begin = buf.read_u32::<BigEndian>().map_err(format_err)?;
                Message::Piece {
                    index,
                    begin,
                    block: buf.to_vec(),
                }
            }
            9 => {
                expect(2, "port")?;
                Message::Port(buf.read_u16::<BigEndian>().map_err(format_err)?)
            }
            _ => {
                return Err(ApplicationError::FormatError(format!(
                    "unknown message id: {}",
                    id
                )));
            }
        };
        Ok(message)
    }
}

fn format_err(e: std::io::Error) -> ApplicationError {
    ApplicationError::FormatError(format!("protocol: {}", e))
}

/// Frames [`Message`]s on a byte stream, buffering partial frames until
/// they are complete
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ApplicationError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ApplicationError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len > MAX_FRAME_LEN {
            return Err(ApplicationError::ProtocolError(format!(
                "frame of {} bytes exceeds the {} byte limit",
                len, MAX_FRAME_LEN
            )));
        }

        let frame_len = 4 + len as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        Message::decode(frame.chunk()).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ApplicationError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ApplicationError> {
        item.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_layout() {
        let hs = Handshake::new([0xAA; 20], *b"-BL0001-abcdefghijkl");
        let buf = hs.encode();

        assert_eq!(buf.len(), HANDSHAKE_LEN);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(&buf[28..48], &[0xAA; 20]);
        assert_eq!(&buf[48..68], b"-BL0001-abcdefghijkl");
        assert_eq!(Handshake::decode(&buf), Some(hs));
    }

    #[test]
    fn handshake_decode_ignores_trailing_bytes() {
        let hs = Handshake::new([1; 20], [2; 20]);
        let mut buf = hs.encode().to_vec();
        buf.extend_from_slice(&Message::Unchoke.encode());
        assert_eq!(Handshake::decode(&buf), Some(hs));
    }

    #[test]
    fn handshake_decode_rejects_bad_input() {
        let buf = Handshake::new([1; 20], [2; 20]).encode();
        assert_eq!(Handshake::decode(&buf[..67]), None);
        assert_eq!(Handshake::decode(&[]), None);

        let mut wrong_len = buf;
        wrong_len[0] = 18;
        assert_eq!(Handshake::decode(&wrong_len), None);
    }

    #[test]
    fn encodes_byte_exact_frames() {
        assert_eq!(Message::KeepAlive.encode(), [0, 0, 0, 0]);
        assert_eq!(Message::Choke.encode(), [0, 0, 0, 1, 0]);
        assert_eq!(Message::Unchoke.encode(), [0, 0, 0, 1, 1]);
        assert_eq!(Message::Interested.encode(), [0, 0, 0, 1, 2]);
        assert_eq!(Message::NotInterested.encode(), [0, 0, 0, 1, 3]);
        assert_eq!(Message::Have(258).encode(), [0, 0, 0, 5, 4, 0, 0, 1, 2]);
        assert_eq!(
            Message::Bitfield(vec![0b1010_0000, 0xFF]).encode(),
            [0, 0, 0, 3, 5, 0b1010_0000, 0xFF]
        );
        assert_eq!(
            Message::Request {
                index: 1,
                begin: 16384,
                length: 16384
            }
            .encode(),
            [0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
        assert_eq!(
            Message::Piece {
                index: 2,
                begin: 0,
                block: vec![9, 8, 7]
            }
            .encode(),
            [0, 0, 0, 12, 7, 0, 0, 0, 2, 0, 0, 0, 0, 9, 8, 7]
        );
        assert_eq!(
            Message::Cancel {
                index: 0,
                begin: 1,
                length: 2
            }
            .encode(),
            [0, 0, 0, 13, 8, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 2]
        );
        assert_eq!(Message::Port(6881).encode(), [0, 0, 0, 3, 9, 0x1A, 0xE1]);
    }

    #[test]
    fn decodes_what_it_encodes() {
        let messages = [
            Message::KeepAlive,
            Message::Choke,
            Message::Have(7),
            Message::Bitfield(vec![0xF0]),
            Message::Request {
                index: 3,
                begin: 32768,
                length: 100,
            },
            Message::Piece {
                index: 1,
                begin: 16384,
                block: vec![1; 32],
            },
        ];
        for msg in messages {
            assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        // have with a 2-byte payload
        let res = Message::decode(&[0, 0, 0, 3, 4, 0, 1]);
        assert!(matches!(res, Err(ApplicationError::FormatError(_))));

        // prefix longer than the frame
        let res = Message::decode(&[0, 0, 0, 5, 4, 0, 0]);
        assert!(matches!(res, Err(ApplicationError::FormatError(_))));

        // trailing garbage after an unchoke
        let res = Message::decode(&[0, 0, 0, 1, 1, 0xFF]);
        assert!(matches!(res, Err(ApplicationError::FormatError(_))));

        // choke carrying a payload
        let res = Message::decode(&[0, 0, 0, 2, 0, 0]);
        assert!(matches!(res, Err(ApplicationError::FormatError(_))));

        let res = Message::decode(&[0, 0, 0, 1, 42]);
        assert!(matches!(res, Err(ApplicationError::FormatError(_))));
    }

    #[test]
    fn codec_reassembles_split_frames() {
        let mut codec = MessageCodec;
        let piece = Message::Piece {
            index: 0,
            begin: 0,
            block: vec![5; 100],
        };
        let mut wire = piece.encode();
        wire.extend_from_slice(&Message::KeepAlive.encode());
        wire.extend_from_slice(&Message::Unchoke.encode());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..2]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&wire[2..60]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&wire[60..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(piece));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_rejects_oversized_frames() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        buf.extend_from_slice(&[7]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ApplicationError::ProtocolError(_))
        ));
    }
}
