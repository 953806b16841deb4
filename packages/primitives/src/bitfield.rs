//! The per-piece bitfield: one bit per piece, packed big-endian (bit 7 of
//! byte 0 is piece 0), exactly as it crosses the wire in the `bitfield`
//! message.
use thiserror::Error;

/// A fixed-size bitfield with a cached count of set bits.
///
/// The size is pinned to the torrent's piece count at construction and never
/// changes. Round-trips through [`Bitfield::to_bytes`] are bit-exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    bit_len: usize,
    set_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitfieldError {
    #[error("bitfield needs {expected} bytes for {bits} bits, got {actual}")]
    WrongByteLength { bits: usize, expected: usize, actual: usize },
    #[error("a spare bit beyond the piece count is set")]
    SpareBitSet,
}

impl Bitfield {
    /// An all-zero bitfield sized for `bit_len` pieces.
    #[must_use]
    pub fn new(bit_len: usize) -> Self {
        Self {
            bytes: vec![0u8; bit_len.div_ceil(8)],
            bit_len,
            set_count: 0,
        }
    }

    /// Rebuild a bitfield from its wire form.
    ///
    /// Bits beyond `bit_len` are ignored, which makes this usable for both
    /// wire `bitfield` messages (where spare bits must be rejected by the
    /// caller via [`Bitfield::from_wire_bytes`]) and resume records (where
    /// spare bits are tolerated).
    ///
    /// # Errors
    ///
    /// Fails when the byte length does not match `ceil(bit_len / 8)`.
    pub fn from_bytes(bytes: &[u8], bit_len: usize) -> Result<Self, BitfieldError> {
        let expected = bit_len.div_ceil(8);
        if bytes.len() != expected {
            return Err(BitfieldError::WrongByteLength {
                bits: bit_len,
                expected,
                actual: bytes.len(),
            });
        }

        let mut field = Self {
            bytes: bytes.to_vec(),
            bit_len,
            set_count: 0,
        };
        field.clear_spare_bits();
        field.set_count = field.bytes.iter().map(|b| b.count_ones() as usize).sum();
        Ok(field)
    }

    /// Like [`Bitfield::from_bytes`] but rejects set bits beyond the piece
    /// count, as required for the wire `bitfield` message.
    ///
    /// # Errors
    ///
    /// Fails on a length mismatch or on a set spare bit.
    pub fn from_wire_bytes(bytes: &[u8], bit_len: usize) -> Result<Self, BitfieldError> {
        let expected = bit_len.div_ceil(8);
        if bytes.len() != expected {
            return Err(BitfieldError::WrongByteLength {
                bits: bit_len,
                expected,
                actual: bytes.len(),
            });
        }

        let spare_bits = expected * 8 - bit_len;
        if spare_bits > 0 {
            let mask = ((1u16 << spare_bits) - 1) as u8;
            if let Some(last) = bytes.last() {
                if last & mask != 0 {
                    return Err(BitfieldError::SpareBitSet);
                }
            }
        }
        Self::from_bytes(bytes, bit_len)
    }

    /// The wire form: `ceil(bit_len / 8)` bytes, spare bits zero.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bit_len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bit_len == 0
    }

    #[must_use]
    pub fn set_count(&self) -> usize {
        self.set_count
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.set_count == self.bit_len
    }

    #[must_use]
    pub fn has(&self, index: usize) -> bool {
        if index >= self.bit_len {
            return false;
        }
        self.bytes[index / 8] & Self::mask(index) != 0
    }

    /// Set a bit. Out-of-range indexes are ignored.
    pub fn set(&mut self, index: usize) {
        if index < self.bit_len && !self.has(index) {
            self.bytes[index / 8] |= Self::mask(index);
            self.set_count += 1;
        }
    }

    /// Clear a bit. Out-of-range indexes are ignored.
    pub fn clear(&mut self, index: usize) {
        if index < self.bit_len && self.has(index) {
            self.bytes[index / 8] &= !Self::mask(index);
            self.set_count -= 1;
        }
    }

    /// Indexes of all set bits, ascending.
    pub fn set_indexes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bit_len).filter(|i| self.has(*i))
    }

    /// Indexes of all clear bits, ascending.
    pub fn clear_indexes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bit_len).filter(|i| !self.has(*i))
    }

    /// True when `other` has at least one piece this bitfield lacks. This is
    /// the wire-protocol notion of interest.
    #[must_use]
    pub fn is_interested_in(&self, other: &Bitfield) -> bool {
        other.set_indexes().any(|i| !self.has(i))
    }

    fn mask(index: usize) -> u8 {
        0x80 >> (index % 8)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bytes.len() * 8 - self.bit_len;
        if spare > 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= !(((1u16 << spare) - 1) as u8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Bitfield, BitfieldError};

    #[test]
    fn round_trips_through_byte_form() {
        let mut field = Bitfield::new(11);
        for i in [0, 3, 7, 8, 10] {
            field.set(i);
        }

        let restored = Bitfield::from_bytes(&field.to_bytes(), 11).unwrap();
        assert_eq!(restored, field);
        assert_eq!(restored.set_count(), 5);
    }

    #[test]
    fn set_count_tracks_set_and_clear() {
        let mut field = Bitfield::new(8);
        field.set(2);
        field.set(2);
        assert_eq!(field.set_count(), 1);

        field.clear(2);
        field.clear(2);
        assert_eq!(field.set_count(), 0);
    }

    #[test]
    fn out_of_range_bits_are_ignored() {
        let mut field = Bitfield::new(3);
        field.set(3);
        assert_eq!(field.set_count(), 0);
        assert!(!field.has(3));
    }

    #[test]
    fn resume_form_ignores_spare_bits() {
        // 3 bits in 1 byte; the low 5 bits are spares.
        let field = Bitfield::from_bytes(&[0b1011_1111], 3).unwrap();
        assert_eq!(field.set_count(), 2);
        assert_eq!(field.to_bytes(), vec![0b1010_0000]);
    }

    #[test]
    fn wire_form_rejects_spare_bits() {
        assert_eq!(
            Bitfield::from_wire_bytes(&[0b1010_0001], 3),
            Err(BitfieldError::SpareBitSet)
        );
        assert!(Bitfield::from_wire_bytes(&[0b1010_0000], 3).is_ok());
    }

    #[test]
    fn wrong_byte_length_is_rejected() {
        assert!(matches!(
            Bitfield::from_bytes(&[0, 0], 3),
            Err(BitfieldError::WrongByteLength { .. })
        ));
    }

    #[test]
    fn interest_means_they_have_a_piece_we_lack() {
        let mut ours = Bitfield::new(4);
        let mut theirs = Bitfield::new(4);
        theirs.set(2);

        assert!(ours.is_interested_in(&theirs));
        ours.set(2);
        assert!(!ours.is_interested_in(&theirs));
    }

    #[test]
    fn completion_is_all_bits_set() {
        let mut field = Bitfield::new(2);
        field.set(0);
        assert!(!field.is_complete());
        field.set(1);
        assert!(field.is_complete());
    }
}
