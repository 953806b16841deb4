//! Primitive types shared by the riptide packages.
//!
//! These are the value types every other crate in the workspace speaks:
//! identifiers ([`InfoHash`], [`PeerId`]), the per-piece [`Bitfield`], the
//! announce event vocabulary and file selection [`Priority`]. They carry no
//! I/O and no protocol logic.
pub mod announce_event;
pub mod bitfield;
pub mod info_hash;
pub mod peer_id;
pub mod priority;

pub use announce_event::AnnounceEvent;
pub use bitfield::Bitfield;
pub use info_hash::InfoHash;
pub use peer_id::PeerId;
pub use priority::Priority;

/// Blocks are the unit of `request`/`piece` wire messages: 16 KiB, except
/// the final block of a piece which may be shorter.
pub const BLOCK_LEN: u32 = 16 * 1024;
