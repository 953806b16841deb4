use thiserror::Error;

/// Reason a buffer failed to decode, with the byte offset at which decoding
/// gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer ended in the middle of a value at offset {pos}")]
    UnexpectedEnd { pos: usize },

    #[error("byte {byte:#04x} at offset {pos} does not start a value")]
    InvalidByte { byte: u8, pos: usize },

    #[error("integer starting at offset {pos} has no 'e' terminator")]
    UnterminatedInt { pos: usize },

    #[error("integer at offset {pos} is not a valid decimal number")]
    InvalidInt { pos: usize },

    #[error("integer at offset {pos} is negative zero")]
    NegativeZero { pos: usize },

    #[error("integer at offset {pos} has leading zeros")]
    LeadingZeros { pos: usize },

    #[error("byte string length at offset {pos} overflows the buffer")]
    LengthOverflow { pos: usize },

    #[error("dictionary key {key:?} at offset {pos} is not in ascending order")]
    UnsortedKey { pos: usize, key: Vec<u8> },

    #[error("dictionary key {key:?} at offset {pos} appears more than once")]
    DuplicateKey { pos: usize, key: Vec<u8> },

    #[error("container starting at offset {pos} is never terminated")]
    UnterminatedContainer { pos: usize },

    #[error("nesting at offset {pos} exceeds the recursion limit")]
    TooDeep { pos: usize },

    #[error("{trailing} trailing bytes after the value ending at offset {pos}")]
    TrailingBytes { pos: usize, trailing: usize },
}
