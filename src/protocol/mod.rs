//! The `BitTorrent` peer wire protocol: the 68-byte handshake, the
//! length-prefixed message framing used after it, and the BEP 10 extension
//! layer.
//!
//! Everything here is pure codec work. Session behavior (who may send what,
//! and when) lives in [`crate::core::session`].
pub mod extended;
pub mod handshake;
pub mod message;

use thiserror::Error;

/// Frames larger than this close the session. Large enough for a `piece`
/// frame carrying a full 16 KiB block on top of a generous piece header,
/// small enough to bound per-peer buffering.
pub const MAX_FRAME_LEN: usize = (1 << 17) + 16 * 1024;

/// Errors produced while encoding or decoding wire traffic.
///
/// Any of these closes the offending session; other sessions continue.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error on the peer socket: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake is malformed")]
    BadHandshake,

    #[error("handshake carries info-hash {actual} but {expected} was expected")]
    InfoHashMismatch {
        expected: riptide_primitives::InfoHash,
        actual: riptide_primitives::InfoHash,
    },

    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    Oversized { len: usize },

    #[error("message id {id} has payload length {len}, which is invalid")]
    BadLength { id: u8, len: usize },

    #[error("message id {id} is not part of the protocol")]
    UnknownId { id: u8 },

    #[error("extension payload is not valid bencode: {0}")]
    BadExtensionPayload(#[from] riptide_bencode::DecodeError),

    #[error("extension handshake is not a dictionary")]
    BadExtensionHandshake,
}
