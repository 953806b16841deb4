//! Multi-file piece storage with hash verification.
//!
//! A torrent's data is one byte stream chopped into pieces, laid across one
//! or more files. [`Storage`] owns the directory rooted at the download
//! path (plus the torrent name for multi-file torrents), maps piece reads
//! and writes onto file slices, and refuses to persist anything whose SHA-1
//! does not match the metainfo.
//!
//! All file I/O is blocking and runs on the runtime's blocking pool; the
//! async methods are thin `spawn_blocking` wrappers. A single coarse mutex
//! guards the handle cache and is held across each read or write, which
//! serializes file access; hashing happens outside the lock.
pub mod file_cache;

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use riptide_metainfo::Metainfo;
use riptide_primitives::Bitfield;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, instrument};

use self::file_cache::{FileCache, DEFAULT_CAPACITY, IDLE_LIMIT};

/// Upper bound on threads hashing concurrently during a full verify scan.
const MAX_VERIFY_THREADS: usize = 4;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path {path:?} would escape the download root")]
    UnsafePath { path: PathBuf },

    #[error("piece {piece} does not match its expected hash")]
    HashMismatch { piece: usize },

    #[error("piece {piece} of {length} bytes was given {actual} bytes")]
    WrongPieceLength { piece: usize, length: u32, actual: usize },

    #[error("failed reading {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed writing {path:?}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage worker terminated abnormally")]
    TaskFailed,
}

struct StoredFile {
    /// Absolute path, already vetted by [`safe_join`].
    path: PathBuf,
    length: u64,
}

struct StorageInner {
    metainfo: Arc<Metainfo>,
    root: PathBuf,
    files: Vec<StoredFile>,
    cache: Mutex<FileCache>,
}

/// Handle to a torrent's on-disk data. Cheap to clone; clones share the
/// handle cache.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Bind storage for `metainfo` under `download_path`. Multi-file
    /// torrents get a directory named after the torrent; single-file
    /// torrents live directly under the download path.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::UnsafePath`] when any file path would
    /// resolve outside the download root.
    pub fn new(metainfo: Arc<Metainfo>, download_path: &Path) -> Result<Self, StorageError> {
        let root = match metainfo.directory() {
            Some(directory) => safe_join(download_path, Path::new(directory))?,
            None => download_path.to_path_buf(),
        };

        let files = metainfo
            .files()
            .iter()
            .map(|entry| {
                Ok(StoredFile {
                    path: safe_join(&root, &entry.path)?,
                    length: entry.length,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        Ok(Self {
            inner: Arc::new(StorageInner {
                metainfo,
                root,
                files,
                cache: Mutex::new(FileCache::new(DEFAULT_CAPACITY, IDLE_LIMIT)),
            }),
        })
    }

    /// The directory (or single file's parent) all data lives under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Create directories and files, preallocating each file to its
    /// declared length.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::WriteFailed`] on filesystem errors.
    pub async fn init(&self) -> Result<(), StorageError> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.init()).await
    }

    /// Read one full piece, assembled across its files. `None` when any
    /// backing file is missing or too short.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::ReadFailed`] on filesystem errors other
    /// than missing data.
    pub async fn read_piece(&self, piece: usize) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.read_range(piece, 0, inner.metainfo.piece_length(piece))).await
    }

    /// Read part of a piece, for serving `request` messages.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::ReadFailed`] on filesystem errors other
    /// than missing data.
    pub async fn read_range(&self, piece: usize, offset: u32, length: u32) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.read_range(piece, offset, length)).await
    }

    /// Verify `data` against the piece hash and, on a match, write it out.
    /// Nothing is written on a mismatch.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::HashMismatch`] on a bad hash and
    /// [`StorageError::WriteFailed`] on filesystem errors.
    pub async fn write_piece(&self, piece: usize, data: Vec<u8>) -> Result<(), StorageError> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.write_piece(piece, &data)).await
    }

    /// Hash-scan every piece against what is already on disk, in bounded
    /// parallelism. `progress` receives `(pieces_scanned, piece_count)`.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::ReadFailed`] on filesystem errors other
    /// than missing data.
    pub async fn verify_existing(
        &self,
        progress: impl Fn(usize, usize) + Send + Sync + 'static,
    ) -> Result<Bitfield, StorageError> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.verify_existing(&progress)).await
    }

    /// Drop every cached file handle. Pending OS buffers are left to the
    /// kernel.
    pub async fn close_all(&self) {
        let inner = Arc::clone(&self.inner);
        let _ = run_blocking(move || {
            inner.cache.lock().expect("storage lock poisoned").close_all();
            Ok(())
        })
        .await;
    }
}

async fn run_blocking<R: Send + 'static>(
    work: impl FnOnce() -> Result<R, StorageError> + Send + 'static,
) -> Result<R, StorageError> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|_| StorageError::TaskFailed)?
}

impl StorageInner {
    #[instrument(skip(self), fields(root = ?self.root))]
    fn init(&self) -> Result<(), StorageError> {
        let mut cache = self.cache.lock().expect("storage lock poisoned");

        for (index, file) in self.files.iter().enumerate() {
            if let Some(parent) = file.path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| StorageError::WriteFailed {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }

            cache
                .with_file(index, &file.path, true, |handle| {
                    let current = handle.metadata()?.len();
                    if current != file.length {
                        handle.set_len(file.length)?;
                    }
                    Ok(())
                })
                .map_err(|source| StorageError::WriteFailed {
                    path: file.path.clone(),
                    source,
                })?;
        }

        debug!(files = self.files.len(), "storage initialized");
        Ok(())
    }

    fn read_range(&self, piece: usize, offset: u32, length: u32) -> Result<Option<Vec<u8>>, StorageError> {
        let piece_len = self.metainfo.piece_length(piece);
        debug_assert!(offset + length <= piece_len);

        let mut data = vec![0u8; length as usize];
        let range_start = u64::from(offset);
        let range_end = range_start + u64::from(length);

        for slice in self.metainfo.files_for_piece(piece) {
            let slice_start = u64::from(slice.piece_offset);
            let slice_end = slice_start + u64::from(slice.length);
            let start = range_start.max(slice_start);
            let end = range_end.min(slice_end);
            if start >= end {
                continue;
            }

            let file = &self.files[slice.file_index];
            let file_offset = slice.file_offset + (start - slice_start);
            if file_offset + (end - start) > file.length {
                return Ok(None);
            }

            let buffer = &mut data[(start - range_start) as usize..(end - range_start) as usize];
            let mut cache = self.cache.lock().expect("storage lock poisoned");
            let read = cache.with_file(slice.file_index, &file.path, false, |handle| {
                if handle.metadata()?.len() < file_offset + (end - start) {
                    return Ok(false);
                }
                handle.seek(SeekFrom::Start(file_offset))?;
                handle.read_exact(buffer)?;
                Ok(true)
            });

            match read {
                Ok(true) => {}
                Ok(false) => return Ok(None),
                Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(source) if source.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(source) => {
                    return Err(StorageError::ReadFailed {
                        path: file.path.clone(),
                        source,
                    })
                }
            }
        }

        Ok(Some(data))
    }

    fn write_piece(&self, piece: usize, data: &[u8]) -> Result<(), StorageError> {
        let piece_len = self.metainfo.piece_length(piece);
        if data.len() != piece_len as usize {
            return Err(StorageError::WrongPieceLength {
                piece,
                length: piece_len,
                actual: data.len(),
            });
        }

        let digest: [u8; 20] = Sha1::digest(data).into();
        if digest != self.metainfo.piece_hash(piece) {
            return Err(StorageError::HashMismatch { piece });
        }

        for slice in self.metainfo.files_for_piece(piece) {
            let file = &self.files[slice.file_index];
            let chunk = &data[slice.piece_offset as usize..(slice.piece_offset + slice.length) as usize];

            let mut cache = self.cache.lock().expect("storage lock poisoned");
            cache
                .with_file(slice.file_index, &file.path, true, |handle| {
                    handle.seek(SeekFrom::Start(slice.file_offset))?;
                    handle.write_all(chunk)
                })
                .map_err(|source| StorageError::WriteFailed {
                    path: file.path.clone(),
                    source,
                })?;
        }

        Ok(())
    }

    fn verify_existing(&self, progress: &(impl Fn(usize, usize) + Send + Sync)) -> Result<Bitfield, StorageError> {
        let piece_count = self.metainfo.piece_count();
        let verified = Mutex::new(Bitfield::new(piece_count));
        let next_piece = AtomicUsize::new(0);
        let scanned = AtomicUsize::new(0);
        let failure: Mutex<Option<StorageError>> = Mutex::new(None);

        let workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
            .min(MAX_VERIFY_THREADS)
            .max(1);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let piece = next_piece.fetch_add(1, Ordering::Relaxed);
                    if piece >= piece_count {
                        break;
                    }

                    match self.read_range(piece, 0, self.metainfo.piece_length(piece)) {
                        Ok(Some(data)) => {
                            let digest: [u8; 20] = Sha1::digest(&data).into();
                            if digest == self.metainfo.piece_hash(piece) {
                                verified.lock().expect("verify lock poisoned").set(piece);
                            }
                        }
                        Ok(None) => {}
                        Err(error) => {
                            failure.lock().expect("verify lock poisoned").get_or_insert(error);
                            break;
                        }
                    }

                    let done = scanned.fetch_add(1, Ordering::Relaxed) + 1;
                    progress(done, piece_count);
                });
            }
        });

        if let Some(error) = failure.into_inner().expect("verify lock poisoned") {
            return Err(error);
        }
        Ok(verified.into_inner().expect("verify lock poisoned"))
    }
}

/// Join `relative` onto `root`, rejecting anything that could escape it:
/// absolute paths, `..`, and non-normal components.
///
/// # Errors
///
/// Fails with [`StorageError::UnsafePath`] on a rejected path.
pub fn safe_join(root: &Path, relative: &Path) -> Result<PathBuf, StorageError> {
    let mut joined = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            _ => {
                return Err(StorageError::UnsafePath {
                    path: relative.to_path_buf(),
                })
            }
        }
    }
    if joined == root {
        return Err(StorageError::UnsafePath {
            path: relative.to_path_buf(),
        });
    }
    Ok(joined)
}
