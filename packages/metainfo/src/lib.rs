//! Parsing and validation of `BitTorrent` metainfo files.
//!
//! A [`Metainfo`] is immutable after construction. The info-hash is the
//! SHA-1 over the exact byte span of the `info` value inside the outer
//! dictionary, which the bencode decoder exposes directly; nothing is
//! re-encoded.
//!
//! File paths coming out of a torrent are attacker-controlled, so every
//! component is sanitized at parse time: empty components, `.`, `..`,
//! absolute roots and backslashes all fail the parse with
//! [`Error::UnsafePath`].
pub mod error;
pub mod files;

use std::path::PathBuf;

use riptide_bencode::Value;
use riptide_primitives::InfoHash;
use sha1::{Digest, Sha1};
use url::Url;

pub use crate::error::Error;
pub use crate::files::{FileEntry, FileSlice};

/// Length of one SHA-1 piece hash inside the `pieces` byte string.
const PIECE_HASH_LEN: usize = 20;

/// A parsed metainfo file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    name: String,
    piece_length: u32,
    piece_count: usize,
    total_length: u64,
    files: Vec<FileEntry>,
    /// `Some` when the torrent is multi-file; files then live under a
    /// directory named after the torrent.
    directory: Option<String>,
    info_hash: InfoHash,
    piece_hashes: Vec<u8>,
    trackers: Vec<Vec<Url>>,
    comment: Option<String>,
    created_by: Option<String>,
    creation_date: Option<i64>,
}

impl Metainfo {
    /// Parse a metainfo file from its raw bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::MalformedBencode`] when the buffer is not valid
    /// bencode, [`Error::UnsafePath`] when a file path escapes the download
    /// root, and other [`Error`] variants for missing or inconsistent keys.
    pub fn parse(bytes: &[u8]) -> Result<Metainfo, Error> {
        let root = Value::decode(bytes)?;
        let info = root.lookup(b"info").ok_or(Error::MissingKey { key: "info" })?;
        info.as_dict().ok_or(Error::WrongType { key: "info" })?;

        let info_hash = InfoHash(Sha1::digest(info.raw_bytes()).into());

        let name = required_str(info, "name")?.to_owned();
        if name.is_empty() {
            return Err(Error::WrongType { key: "name" });
        }

        let piece_length = required_int(info, "piece length")?;
        let piece_length = u32::try_from(piece_length).map_err(|_| Error::WrongType { key: "piece length" })?;
        if piece_length == 0 {
            return Err(Error::WrongType { key: "piece length" });
        }

        let piece_hashes = info
            .lookup(b"pieces")
            .ok_or(Error::MissingKey { key: "pieces" })?
            .as_bytes()
            .ok_or(Error::WrongType { key: "pieces" })?
            .to_vec();
        if piece_hashes.len() % PIECE_HASH_LEN != 0 {
            return Err(Error::BadPieceHashes {
                length: piece_hashes.len(),
            });
        }
        let piece_count = piece_hashes.len() / PIECE_HASH_LEN;

        let (files, directory) = parse_files(info, &name)?;
        let total_length: u64 = files.iter().map(|f| f.length).sum();

        // The hash list and the byte stream must describe the same torrent.
        let expected_pieces = usize::try_from(total_length.div_ceil(u64::from(piece_length)))
            .map_err(|_| Error::WrongType { key: "length" })?;
        if piece_count != expected_pieces {
            return Err(Error::PieceCountMismatch {
                hashes: piece_count,
                expected: expected_pieces,
            });
        }

        let trackers = parse_trackers(&root)?;

        Ok(Metainfo {
            name,
            piece_length,
            piece_count,
            total_length,
            files,
            directory,
            info_hash,
            piece_hashes,
            trackers,
            comment: optional_str(&root, "comment"),
            created_by: optional_str(&root, "created by"),
            creation_date: root.lookup(b"creation date").and_then(Value::as_int),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    #[must_use]
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    #[must_use]
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// The directory files are nested under, for multi-file torrents.
    #[must_use]
    pub fn directory(&self) -> Option<&str> {
        self.directory.as_deref()
    }

    /// Announce URL tiers, in the order they should be tried.
    #[must_use]
    pub fn trackers(&self) -> &[Vec<Url>] {
        &self.trackers
    }

    #[must_use]
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    #[must_use]
    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    #[must_use]
    pub fn creation_date(&self) -> Option<i64> {
        self.creation_date
    }

    /// Length in bytes of piece `index`. Only the last piece may be shorter
    /// than the nominal piece length.
    ///
    /// # Panics
    ///
    /// Will panic if `index` is out of range.
    #[must_use]
    pub fn piece_length(&self, index: usize) -> u32 {
        assert!(index < self.piece_count);

        if index + 1 == self.piece_count {
            let remainder = self.total_length - u64::from(self.nominal_piece_length()) * (self.piece_count as u64 - 1);
            u32::try_from(remainder).expect("the last piece is never longer than the nominal length")
        } else {
            self.nominal_piece_length()
        }
    }

    /// The `piece length` key: the length of every piece except possibly the
    /// last.
    #[must_use]
    pub fn nominal_piece_length(&self) -> u32 {
        self.piece_length
    }

    /// The expected SHA-1 of piece `index`.
    ///
    /// # Panics
    ///
    /// Will panic if `index` is out of range.
    #[must_use]
    pub fn piece_hash(&self, index: usize) -> [u8; PIECE_HASH_LEN] {
        let start = index * PIECE_HASH_LEN;
        let mut hash = [0u8; PIECE_HASH_LEN];
        hash.copy_from_slice(&self.piece_hashes[start..start + PIECE_HASH_LEN]);
        hash
    }

    /// The slices of piece `index` across the torrent's files. The returned
    /// slices are contiguous in piece order and cover exactly
    /// `piece_length(index)` bytes.
    #[must_use]
    pub fn files_for_piece(&self, index: usize) -> Vec<FileSlice> {
        let piece_start = u64::from(self.nominal_piece_length()) * index as u64;
        let piece_end = piece_start + u64::from(self.piece_length(index));

        self.files
            .iter()
            .enumerate()
            .filter_map(|(file_index, file)| {
                let file_end = file.offset + file.length;
                let start = piece_start.max(file.offset);
                let end = piece_end.min(file_end);
                if start >= end {
                    return None;
                }
                Some(FileSlice {
                    file_index,
                    file_offset: start - file.offset,
                    piece_offset: u32::try_from(start - piece_start).expect("piece offsets fit in u32"),
                    length: u32::try_from(end - start).expect("slice lengths fit in u32"),
                })
            })
            .collect()
    }

    /// Indexes of the files piece `index` overlaps.
    #[must_use]
    pub fn file_indexes_for_piece(&self, index: usize) -> Vec<usize> {
        self.files_for_piece(index).iter().map(|s| s.file_index).collect()
    }
}

fn required_str<'a>(dict: &'a Value<'_>, key: &'static str) -> Result<&'a str, Error> {
    dict.lookup(key.as_bytes())
        .ok_or(Error::MissingKey { key })?
        .as_str()
        .ok_or(Error::WrongType { key })
}

fn required_int(dict: &Value<'_>, key: &'static str) -> Result<i64, Error> {
    dict.lookup(key.as_bytes())
        .ok_or(Error::MissingKey { key })?
        .as_int()
        .ok_or(Error::WrongType { key })
}

fn optional_str(dict: &Value<'_>, key: &str) -> Option<String> {
    dict.lookup(key.as_bytes()).and_then(Value::as_str).map(str::to_owned)
}

/// Builds the ordered file list with cumulative offsets, from either the
/// single-file `length` key or the multi-file `files` list.
fn parse_files(info: &Value<'_>, name: &str) -> Result<(Vec<FileEntry>, Option<String>), Error> {
    match (info.lookup(b"length"), info.lookup(b"files")) {
        (Some(length), None) => {
            let length = length.as_int().ok_or(Error::WrongType { key: "length" })?;
            let length = u64::try_from(length).map_err(|_| Error::WrongType { key: "length" })?;
            let path = sanitize_path(&[name.to_owned()])?;
            Ok((vec![FileEntry { path, length, offset: 0 }], None))
        }
        (None, Some(file_list)) => {
            let file_list = file_list.as_list().ok_or(Error::WrongType { key: "files" })?;
            if file_list.is_empty() {
                return Err(Error::WrongType { key: "files" });
            }

            let mut files = Vec::with_capacity(file_list.len());
            let mut offset = 0u64;
            for entry in file_list {
                let length = required_int(entry, "length")?;
                let length = u64::try_from(length).map_err(|_| Error::WrongType { key: "length" })?;

                let components: Vec<String> = entry
                    .lookup(b"path")
                    .ok_or(Error::MissingKey { key: "path" })?
                    .as_list()
                    .ok_or(Error::WrongType { key: "path" })?
                    .iter()
                    .map(|c| c.as_str().map(str::to_owned).ok_or(Error::WrongType { key: "path" }))
                    .collect::<Result<_, _>>()?;

                let path = sanitize_path(&components)?;
                files.push(FileEntry { path, length, offset });
                offset += length;
            }
            Ok((files, Some(name.to_owned())))
        }
        (Some(_), Some(_)) => Err(Error::AmbiguousFileMode),
        (None, None) => Err(Error::MissingKey { key: "length" }),
    }
}

/// Turns torrent path components into a relative path that cannot escape
/// the download root. Fail-closed: anything suspicious rejects the torrent.
fn sanitize_path(components: &[String]) -> Result<PathBuf, Error> {
    if components.is_empty() {
        return Err(Error::UnsafePath {
            path: String::new(),
        });
    }

    let mut path = PathBuf::new();
    for component in components {
        let unsafe_component = component.is_empty()
            || component == "."
            || component == ".."
            || component.contains('/')
            || component.contains('\\')
            || component.contains('\0');
        if unsafe_component {
            return Err(Error::UnsafePath {
                path: components.join("/"),
            });
        }
        path.push(component);
    }
    Ok(path)
}

/// Collects announce tiers from `announce-list`, falling back to the single
/// `announce` key. Unparseable URLs are skipped; empty tiers are dropped.
fn parse_trackers(root: &Value<'_>) -> Result<Vec<Vec<Url>>, Error> {
    let mut tiers: Vec<Vec<Url>> = Vec::new();

    if let Some(announce_list) = root.lookup(b"announce-list") {
        let list = announce_list.as_list().ok_or(Error::WrongType { key: "announce-list" })?;
        for tier in list {
            let tier = tier.as_list().ok_or(Error::WrongType { key: "announce-list" })?;
            let urls: Vec<Url> = tier
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|u| Url::parse(u).ok())
                .collect();
            if !urls.is_empty() {
                tiers.push(urls);
            }
        }
    }

    if tiers.is_empty() {
        match root.lookup(b"announce") {
            Some(announce) => {
                let announce = announce.as_str().ok_or(Error::WrongType { key: "announce" })?;
                if let Ok(url) = Url::parse(announce) {
                    tiers.push(vec![url]);
                }
            }
            None if root.lookup(b"announce-list").is_none() => {
                return Err(Error::MissingKey { key: "announce" });
            }
            None => {}
        }
    }

    Ok(tiers)
}

#[cfg(test)]
mod tests {
    use riptide_bencode::Bencode;
    use sha1::{Digest, Sha1};

    use super::{Error, Metainfo};

    fn single_file_torrent(length: i64, piece_length: i64, piece_count: usize) -> Vec<u8> {
        let info = Bencode::dict([
            ("length", Bencode::Int(length)),
            ("name", Bencode::from("f.bin")),
            ("piece length", Bencode::Int(piece_length)),
            ("pieces", Bencode::bytes(vec![0xaa; 20 * piece_count])),
        ]);
        Bencode::dict([
            ("announce", Bencode::from("http://tracker.example/announce")),
            ("info", info),
        ])
        .encode()
    }

    fn multi_file_torrent() -> Vec<u8> {
        let file = |len: i64, path: &[&str]| {
            Bencode::dict([
                ("length", Bencode::Int(len)),
                (
                    "path",
                    Bencode::List(path.iter().map(|p| Bencode::from(*p)).collect()),
                ),
            ])
        };
        let info = Bencode::dict([
            (
                "files",
                Bencode::List(vec![file(100, &["a.bin"]), file(200, &["sub", "b.bin"])]),
            ),
            ("name", Bencode::from("pack")),
            ("piece length", Bencode::Int(128)),
            ("pieces", Bencode::bytes(vec![0xbb; 20 * 3])),
        ]);
        Bencode::dict([
            ("announce", Bencode::from("http://tracker.example/announce")),
            ("info", info),
        ])
        .encode()
    }

    #[test]
    fn parses_a_single_file_torrent() {
        let torrent = single_file_torrent(49152, 16384, 3);
        let metainfo = Metainfo::parse(&torrent).unwrap();

        assert_eq!(metainfo.name(), "f.bin");
        assert_eq!(metainfo.piece_count(), 3);
        assert_eq!(metainfo.total_length(), 49152);
        assert_eq!(metainfo.files().len(), 1);
        assert!(metainfo.directory().is_none());
        assert_eq!(metainfo.trackers().len(), 1);
    }

    #[test]
    fn info_hash_is_sha1_of_the_info_span() {
        let torrent = single_file_torrent(49152, 16384, 3);
        let metainfo = Metainfo::parse(&torrent).unwrap();

        // Find the literal info value and hash it independently.
        let key = b"4:info";
        let start = torrent.windows(key.len()).position(|w| w == key).unwrap() + key.len();
        let end = torrent.len() - 1; // outer dict 'e'
        let expected: [u8; 20] = Sha1::digest(&torrent[start..end]).into();

        assert_eq!(metainfo.info_hash().0, expected);
    }

    #[test]
    fn parsing_twice_yields_identical_hashes_and_info_mutation_changes_them() {
        let torrent = single_file_torrent(49152, 16384, 3);
        let first = Metainfo::parse(&torrent).unwrap();
        let second = Metainfo::parse(&torrent).unwrap();
        assert_eq!(first.info_hash(), second.info_hash());

        // Flip one byte inside a piece hash (safely inside the info region).
        let mut mutated = torrent.clone();
        let pos = mutated.len() - 4;
        mutated[pos] ^= 0x01;
        let third = Metainfo::parse(&mutated).unwrap();
        assert_ne!(first.info_hash(), third.info_hash());
    }

    #[test]
    fn last_piece_may_be_short() {
        let torrent = single_file_torrent(40000, 16384, 3);
        let metainfo = Metainfo::parse(&torrent).unwrap();

        assert_eq!(metainfo.piece_length(0), 16384);
        assert_eq!(metainfo.piece_length(1), 16384);
        assert_eq!(metainfo.piece_length(2), 40000 - 2 * 16384);
    }

    #[test]
    fn file_slices_cover_each_piece_exactly() {
        let metainfo = Metainfo::parse(&multi_file_torrent()).unwrap();

        for piece in 0..metainfo.piece_count() {
            let slices = metainfo.files_for_piece(piece);
            let covered: u64 = slices.iter().map(|s| u64::from(s.length)).sum();
            assert_eq!(covered, u64::from(metainfo.piece_length(piece)));

            let mut expected_offset = 0u32;
            for slice in &slices {
                assert_eq!(slice.piece_offset, expected_offset);
                expected_offset += slice.length;

                let file = &metainfo.files()[slice.file_index];
                assert!(slice.file_offset + u64::from(slice.length) <= file.length);
            }
        }
    }

    #[test]
    fn a_piece_can_straddle_files() {
        let metainfo = Metainfo::parse(&multi_file_torrent()).unwrap();

        // Piece 0 is bytes [0, 128): 100 from a.bin, 28 from sub/b.bin.
        let slices = metainfo.files_for_piece(0);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].length, 100);
        assert_eq!(slices[1].length, 28);
        assert_eq!(slices[1].file_offset, 0);
    }

    #[test]
    fn rejects_traversal_paths() {
        let file = Bencode::dict([
            ("length", Bencode::Int(10)),
            (
                "path",
                Bencode::List(vec![Bencode::from(".."), Bencode::from("evil.bin")]),
            ),
        ]);
        let info = Bencode::dict([
            ("files", Bencode::List(vec![file])),
            ("name", Bencode::from("pack")),
            ("piece length", Bencode::Int(16384)),
            ("pieces", Bencode::bytes(vec![0xcc; 20])),
        ]);
        let torrent = Bencode::dict([
            ("announce", Bencode::from("http://tracker.example/announce")),
            ("info", info),
        ])
        .encode();

        assert!(matches!(Metainfo::parse(&torrent), Err(Error::UnsafePath { .. })));
    }

    #[test]
    fn rejects_inconsistent_piece_hashes() {
        // 49152 bytes at 16 KiB pieces needs 3 hashes, not 2.
        let torrent = single_file_torrent(49152, 16384, 2);
        assert!(matches!(
            Metainfo::parse(&torrent),
            Err(Error::PieceCountMismatch { hashes: 2, expected: 3 })
        ));
    }

    #[test]
    fn rejects_missing_required_keys() {
        let no_info = Bencode::dict([("announce", Bencode::from("http://t/a"))]).encode();
        assert!(matches!(
            Metainfo::parse(&no_info),
            Err(Error::MissingKey { key: "info" })
        ));

        let torrent = Bencode::dict([(
            "info",
            Bencode::dict([
                ("length", Bencode::Int(16384)),
                ("name", Bencode::from("f")),
                ("piece length", Bencode::Int(16384)),
                ("pieces", Bencode::bytes(vec![0x00; 20])),
            ]),
        )])
        .encode();
        assert!(matches!(
            Metainfo::parse(&torrent),
            Err(Error::MissingKey { key: "announce" })
        ));
    }

    #[test]
    fn announce_list_tiers_are_preserved_in_order() {
        let info = Bencode::dict([
            ("length", Bencode::Int(16384)),
            ("name", Bencode::from("f")),
            ("piece length", Bencode::Int(16384)),
            ("pieces", Bencode::bytes(vec![0x00; 20])),
        ]);
        let torrent = Bencode::dict([
            ("announce", Bencode::from("http://primary.example/announce")),
            (
                "announce-list",
                Bencode::List(vec![
                    Bencode::List(vec![Bencode::from("http://tier1.example/announce")]),
                    Bencode::List(vec![
                        Bencode::from("udp://tier2.example:6969"),
                        Bencode::from("not a url"),
                    ]),
                ]),
            ),
            ("info", info),
        ])
        .encode();

        let metainfo = Metainfo::parse(&torrent).unwrap();
        let tiers = metainfo.trackers();
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[0][0].host_str(), Some("tier1.example"));
        assert_eq!(tiers[1].len(), 1);
        assert_eq!(tiers[1][0].scheme(), "udp");
    }
}
