use thiserror::Error;

/// Why a metainfo file was rejected. None of these are retryable: a torrent
/// that fails to parse is failed at add time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("malformed bencode: {0}")]
    MalformedBencode(#[from] riptide_bencode::DecodeError),

    #[error("metainfo is missing the required key '{key}'")]
    MissingKey { key: &'static str },

    #[error("metainfo key '{key}' has the wrong type or an invalid value")]
    WrongType { key: &'static str },

    #[error("metainfo has both 'length' and 'files'; a torrent is single-file or multi-file, not both")]
    AmbiguousFileMode,

    #[error("'pieces' length {length} is not a multiple of 20")]
    BadPieceHashes { length: usize },

    #[error("'pieces' holds {hashes} hashes but the file lengths require {expected}")]
    PieceCountMismatch { hashes: usize, expected: usize },

    #[error("file path {path:?} would escape the download root")]
    UnsafePath { path: String },
}
