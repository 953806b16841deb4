//! The 20-byte peer identifier exchanged in the wire handshake and sent to
//! trackers.
use std::fmt;

/// A `BitTorrent` peer id.
///
/// Our own ids follow the Azureus convention: a client fragment such as
/// `-RT0100-` followed by twelve random bytes. Remote ids are arbitrary
/// bytes and are kept verbatim.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct PeerId(pub [u8; 20]);

/// Azureus-style prefix identifying this client and version.
pub const CLIENT_FRAGMENT: &[u8; 8] = b"-RT0100-";

impl PeerId {
    /// Create a new `PeerId` from a byte slice.
    ///
    /// # Panics
    ///
    /// Will panic if the slice is not exactly 20 bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), 20);
        let mut data = [0u8; 20];
        data.copy_from_slice(bytes);
        Self(data)
    }

    /// Build our own id from the client fragment plus twelve bytes of
    /// caller-supplied randomness.
    #[must_use]
    pub fn from_entropy(entropy: [u8; 12]) -> Self {
        let mut data = [0u8; 20];
        data[..8].copy_from_slice(CLIENT_FRAGMENT);
        data[8..].copy_from_slice(&entropy);
        Self(data)
    }

    #[must_use]
    pub fn bytes(&self) -> [u8; 20] {
        self.0
    }
}

impl fmt::Display for PeerId {
    /// Remote ids are not guaranteed to be printable; non-ASCII bytes are
    /// shown as `.`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let c = if byte.is_ascii_graphic() { byte as char } else { '.' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{PeerId, CLIENT_FRAGMENT};

    #[test]
    fn own_ids_carry_the_client_fragment() {
        let id = PeerId::from_entropy([7u8; 12]);
        assert_eq!(&id.0[..8], CLIENT_FRAGMENT);
        assert_eq!(&id.0[8..], &[7u8; 12]);
    }

    #[test]
    fn display_masks_unprintable_bytes() {
        let mut bytes = *b"-XX0000-000000000000";
        bytes[19] = 0xff;
        assert_eq!(PeerId(bytes).to_string(), "-XX0000-00000000000.");
    }
}
