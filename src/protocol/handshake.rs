//! The fixed 68-byte handshake that opens every peer connection.
use riptide_primitives::{InfoHash, PeerId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::WireError;

pub const HANDSHAKE_LEN: usize = 68;
const PROTOCOL_NAME: &[u8; 19] = b"BitTorrent protocol";

/// Reserved-bits flag signalling BEP 10 extension support
/// (`reserved[5] |= 0x10`).
const LTEP_BIT: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Our own handshake: advertises only the extension protocol.
    #[must_use]
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= LTEP_BIT;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    #[must_use]
    pub fn supports_extended(&self) -> bool {
        self.reserved[5] & LTEP_BIT != 0
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = PROTOCOL_NAME.len() as u8;
        bytes[1..20].copy_from_slice(PROTOCOL_NAME);
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash.0);
        bytes[48..68].copy_from_slice(&self.peer_id.0);
        bytes
    }

    /// Parse a received handshake.
    ///
    /// # Errors
    ///
    /// Fails with [`WireError::BadHandshake`] when the protocol prefix is
    /// wrong.
    pub fn from_bytes(bytes: &[u8; HANDSHAKE_LEN]) -> Result<Self, WireError> {
        if bytes[0] as usize != PROTOCOL_NAME.len() || &bytes[1..20] != PROTOCOL_NAME {
            return Err(WireError::BadHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);

        Ok(Self {
            info_hash: InfoHash::from_bytes(&bytes[28..48]),
            peer_id: PeerId::from_bytes(&bytes[48..68]),
            reserved,
        })
    }

    /// Check the remote handshake against the info-hash this connection is
    /// supposed to serve.
    ///
    /// # Errors
    ///
    /// Fails with [`WireError::InfoHashMismatch`] on a mismatch.
    pub fn expect_info_hash(&self, expected: InfoHash) -> Result<(), WireError> {
        if self.info_hash == expected {
            Ok(())
        } else {
            Err(WireError::InfoHashMismatch {
                expected,
                actual: self.info_hash,
            })
        }
    }
}

/// Write our handshake to the socket.
///
/// # Errors
///
/// Fails on socket errors.
pub async fn send<W: AsyncWrite + Unpin>(writer: &mut W, handshake: &Handshake) -> Result<(), WireError> {
    writer.write_all(&handshake.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the remote handshake from the socket.
///
/// # Errors
///
/// Fails on socket errors or a malformed handshake. Timeouts are enforced by
/// the caller.
pub async fn receive<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Handshake, WireError> {
    let mut bytes = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut bytes).await?;
    Handshake::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use riptide_primitives::{InfoHash, PeerId};

    use super::{Handshake, HANDSHAKE_LEN};
    use crate::protocol::WireError;

    fn sample() -> Handshake {
        Handshake::new(InfoHash([0x11; 20]), PeerId([0x22; 20]))
    }

    #[test]
    fn round_trips_through_wire_form() {
        let handshake = sample();
        let parsed = Handshake::from_bytes(&handshake.to_bytes()).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn advertises_only_the_extension_bit() {
        let bytes = sample().to_bytes();
        let mut expected_reserved = [0u8; 8];
        expected_reserved[5] = 0x10;
        assert_eq!(&bytes[20..28], &expected_reserved);
        assert!(sample().supports_extended());
    }

    #[test]
    fn rejects_a_wrong_protocol_prefix() {
        let mut bytes = sample().to_bytes();
        bytes[1] = b'X';
        assert!(matches!(
            Handshake::from_bytes(&bytes),
            Err(WireError::BadHandshake)
        ));
    }

    #[test]
    fn detects_info_hash_mismatches() {
        let handshake = sample();
        assert!(handshake.expect_info_hash(InfoHash([0x11; 20])).is_ok());
        assert!(matches!(
            handshake.expect_info_hash(InfoHash([0x99; 20])),
            Err(WireError::InfoHashMismatch { .. })
        ));
    }

    #[test]
    fn wire_form_is_exactly_68_bytes() {
        assert_eq!(sample().to_bytes().len(), HANDSHAKE_LEN);
        assert_eq!(sample().to_bytes()[0], 19);
    }
}
