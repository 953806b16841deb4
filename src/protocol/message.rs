//! Framing for the post-handshake peer protocol: `u32` big-endian length
//! prefix, one id byte (absent for keep-alives), then the payload.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{WireError, MAX_FRAME_LEN};

const CHOKE_ID: u8 = 0;
const UNCHOKE_ID: u8 = 1;
const INTERESTED_ID: u8 = 2;
const NOT_INTERESTED_ID: u8 = 3;
const HAVE_ID: u8 = 4;
const BITFIELD_ID: u8 = 5;
const REQUEST_ID: u8 = 6;
const PIECE_ID: u8 = 7;
const CANCEL_ID: u8 = 8;
const EXTENDED_ID: u8 = 20;

/// One block of a piece: the unit of `request`, `piece` and `cancel`
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockInfo {
    #[must_use]
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self { piece, offset, length }
    }
}

impl std::fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}+{}", self.piece, self.offset, self.length)
    }
}

/// A peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request(BlockInfo),
    Piece { piece: u32, offset: u32, data: Bytes },
    Cancel(BlockInfo),
    Extended { ext_id: u8, payload: Bytes },
}

impl Message {
    /// Payload length plus the id byte; what goes into the length prefix.
    fn frame_len(&self) -> usize {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request(_) | Message::Cancel(_) => 13,
            Message::Piece { data, .. } => 9 + data.len(),
            Message::Extended { payload, .. } => 2 + payload.len(),
        }
    }
}

/// Codec for the peer wire protocol. Frames above [`MAX_FRAME_LEN`] are a
/// protocol violation and fail the decode.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, WireError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(WireError::Oversized { len: frame_len });
        }

        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        if frame_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = src.get_u8();
        let payload_len = frame_len - 1;
        let mut payload = src.split_to(payload_len);

        let message = match id {
            CHOKE_ID | UNCHOKE_ID | INTERESTED_ID | NOT_INTERESTED_ID => {
                if payload_len != 0 {
                    return Err(WireError::BadLength { id, len: frame_len });
                }
                match id {
                    CHOKE_ID => Message::Choke,
                    UNCHOKE_ID => Message::Unchoke,
                    INTERESTED_ID => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            HAVE_ID => {
                if payload_len != 4 {
                    return Err(WireError::BadLength { id, len: frame_len });
                }
                Message::Have {
                    piece: payload.get_u32(),
                }
            }
            BITFIELD_ID => Message::Bitfield(payload.freeze()),
            REQUEST_ID | CANCEL_ID => {
                if payload_len != 12 {
                    return Err(WireError::BadLength { id, len: frame_len });
                }
                let block = BlockInfo::new(payload.get_u32(), payload.get_u32(), payload.get_u32());
                if id == REQUEST_ID {
                    Message::Request(block)
                } else {
                    Message::Cancel(block)
                }
            }
            PIECE_ID => {
                if payload_len < 8 {
                    return Err(WireError::BadLength { id, len: frame_len });
                }
                let piece = payload.get_u32();
                let offset = payload.get_u32();
                Message::Piece {
                    piece,
                    offset,
                    data: payload.freeze(),
                }
            }
            EXTENDED_ID => {
                if payload_len < 1 {
                    return Err(WireError::BadLength { id, len: frame_len });
                }
                let ext_id = payload.get_u8();
                Message::Extended {
                    ext_id,
                    payload: payload.freeze(),
                }
            }
            id => return Err(WireError::UnknownId { id }),
        };

        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), WireError> {
        let frame_len = message.frame_len();
        dst.reserve(4 + frame_len);
        dst.put_u32(frame_len as u32);

        match message {
            Message::KeepAlive => {}
            Message::Choke => dst.put_u8(CHOKE_ID),
            Message::Unchoke => dst.put_u8(UNCHOKE_ID),
            Message::Interested => dst.put_u8(INTERESTED_ID),
            Message::NotInterested => dst.put_u8(NOT_INTERESTED_ID),
            Message::Have { piece } => {
                dst.put_u8(HAVE_ID);
                dst.put_u32(piece);
            }
            Message::Bitfield(bits) => {
                dst.put_u8(BITFIELD_ID);
                dst.put_slice(&bits);
            }
            Message::Request(block) => {
                dst.put_u8(REQUEST_ID);
                dst.put_u32(block.piece);
                dst.put_u32(block.offset);
                dst.put_u32(block.length);
            }
            Message::Piece { piece, offset, data } => {
                dst.put_u8(PIECE_ID);
                dst.put_u32(piece);
                dst.put_u32(offset);
                dst.put_slice(&data);
            }
            Message::Cancel(block) => {
                dst.put_u8(CANCEL_ID);
                dst.put_u32(block.piece);
                dst.put_u32(block.offset);
                dst.put_u32(block.length);
            }
            Message::Extended { ext_id, payload } => {
                dst.put_u8(EXTENDED_ID);
                dst.put_u8(ext_id);
                dst.put_slice(&payload);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::{BlockInfo, Message, MessageCodec};
    use crate::protocol::{WireError, MAX_FRAME_LEN};

    fn round_trip(message: Message) -> Message {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();
        codec.encode(message, &mut buffer).unwrap();
        codec.decode(&mut buffer).unwrap().unwrap()
    }

    #[test]
    fn every_message_kind_round_trips() {
        let messages = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece: 42 },
            Message::Bitfield(Bytes::from_static(&[0b1010_0000])),
            Message::Request(BlockInfo::new(1, 16384, 16384)),
            Message::Piece {
                piece: 1,
                offset: 16384,
                data: Bytes::from_static(b"block-data"),
            },
            Message::Cancel(BlockInfo::new(1, 16384, 16384)),
            Message::Extended {
                ext_id: 0,
                payload: Bytes::from_static(b"d1:md6:ut_pexi1eee"),
            },
        ];

        for message in messages {
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn keep_alive_is_a_bare_zero_length() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();
        codec.encode(Message::Have { piece: 7 }, &mut buffer).unwrap();

        let mut partial = BytesMut::from(&buffer[..3]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&buffer[3..]);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Message::Have { piece: 7 })
        );
    }

    #[test]
    fn oversized_frames_are_rejected_before_buffering() {
        let mut codec = MessageCodec;
        let oversized = (MAX_FRAME_LEN + 1) as u32;
        let mut buffer = BytesMut::from(&oversized.to_be_bytes()[..]);

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(WireError::Oversized { .. })
        ));
    }

    #[test]
    fn wrong_payload_lengths_are_rejected() {
        let mut codec = MessageCodec;
        // `have` with a 2-byte payload.
        let mut buffer = BytesMut::from(&[0, 0, 0, 3, 4, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(WireError::BadLength { id: 4, .. })
        ));
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::from(&[0, 0, 0, 1, 9][..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(WireError::UnknownId { id: 9 })
        ));
    }

    #[test]
    fn piece_needs_at_least_its_header() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::from(&[0, 0, 0, 5, 7, 0, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(WireError::BadLength { id: 7, .. })
        ));
    }

    #[test]
    fn two_messages_in_one_buffer_decode_in_order() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();
        codec.encode(Message::Unchoke, &mut buffer).unwrap();
        codec.encode(Message::Have { piece: 3 }, &mut buffer).unwrap();

        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(Message::Unchoke));
        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(Message::Have { piece: 3 })
        );
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }
}
