use std::path::PathBuf;

/// One file inside a torrent, with its cumulative offset into the
/// concatenated torrent byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Sanitized path, relative to the torrent's download root.
    pub path: PathBuf,
    /// Declared length in bytes.
    pub length: u64,
    /// Offset of the file's first byte within the torrent stream.
    pub offset: u64,
}

/// The substring of a piece that lives in one file: the intersection of the
/// piece's byte range with the file's byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    /// Index into [`crate::Metainfo::files`].
    pub file_index: usize,
    /// Offset of the slice within the file.
    pub file_offset: u64,
    /// Offset of the slice within the piece.
    pub piece_offset: u32,
    /// Slice length in bytes.
    pub length: u32,
}
