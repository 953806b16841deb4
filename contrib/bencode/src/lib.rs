//! Decoding and encoding for bencode, the self-describing binary format used
//! by every BitTorrent-facing surface: metainfo files, tracker responses,
//! KRPC (DHT) messages and extension-protocol payloads.
//!
//! Two representations are provided:
//!
//! - [`Value`] borrows from the input buffer and remembers the raw byte span
//!   of every decoded value. That span is what makes info-hash computation
//!   possible without re-encoding: the SHA-1 of a torrent's `info` dictionary
//!   is taken over `value.raw_bytes()`.
//! - [`Bencode`] owns its data and is used to build messages for the wire.
//!   Encoding is canonical: dictionary keys are emitted in ascending
//!   lexicographic byte order, so `encode` is byte-for-byte stable.
//!
//! # Examples
//!
//! Decoding:
//!
//! ```rust
//! use riptide_bencode::Value;
//!
//! let value = Value::decode(b"d12:lucky_numberi7ee").unwrap();
//! let number = value.lookup(b"lucky_number").unwrap().as_int().unwrap();
//! assert_eq!(number, 7);
//! ```
//!
//! Encoding:
//!
//! ```rust
//! use riptide_bencode::Bencode;
//!
//! let message = Bencode::dict([("lucky_number", Bencode::Int(7))]).encode();
//! assert_eq!(&message, b"d12:lucky_numberi7ee");
//! ```

mod decode;
mod encode;
mod error;

pub use crate::decode::Value;
pub use crate::encode::Bencode;
pub use crate::error::DecodeError;

const INT_START: u8 = b'i';
const LIST_START: u8 = b'l';
const DICT_START: u8 = b'd';
const VALUE_END: u8 = b'e';
const LENGTH_DELIM: u8 = b':';

/// Containers nested deeper than this fail with [`DecodeError::TooDeep`].
/// Real torrent files nest four or five levels at most.
const MAX_DEPTH: usize = 32;
