//! Resume records: the per-torrent checkpoint that lets a restart skip
//! re-downloading (and mostly skip re-hashing) what is already on disk.
//!
//! Each torrent persists a JSON record at `state_path/<info-hash-hex>.state`,
//! and `state_path/torrents.json` lists every known torrent for discovery on
//! startup. Records are written on a 30 s cadence, on state transitions and
//! on graceful shutdown.
use std::path::{Path, PathBuf};

use riptide_primitives::{InfoHash, Priority};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("failed accessing resume state in {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("resume record at {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-file progress and selection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResume {
    pub path: PathBuf,
    pub downloaded: u64,
    pub selected: bool,
    pub priority: Priority,
}

/// Everything needed to restart a torrent without re-hashing from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub info_hash: InfoHash,
    pub torrent_file_path: PathBuf,
    pub download_path: PathBuf,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Big-endian packed verified-piece bits, hex encoded in JSON.
    #[serde(with = "hex_bytes")]
    pub bitfield_bytes: Vec<u8>,
    pub files: Vec<FileResume>,
    pub max_download_bps: Option<u64>,
    pub max_upload_bps: Option<u64>,
    pub priority: Priority,
}

/// One line of `torrents.json`: enough to find and re-add the torrent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub info_hash: InfoHash,
    pub torrent_file_path: PathBuf,
    pub download_path: PathBuf,
}

/// The on-disk state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    /// Create the state directory if needed.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created.
    pub fn init(&self) -> Result<(), ResumeError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ResumeError::Io {
            path: self.dir.clone(),
            source,
        })
    }

    fn record_path(&self, info_hash: InfoHash) -> PathBuf {
        self.dir.join(format!("{info_hash}.state"))
    }

    fn registry_path(&self) -> PathBuf {
        self.dir.join("torrents.json")
    }

    /// Load the resume record for a torrent, `None` when there is none yet.
    /// A corrupt record is discarded with a warning rather than failing the
    /// torrent: the data on disk can still be recovered by a verify scan.
    #[must_use]
    pub fn load(&self, info_hash: InfoHash) -> Option<ResumeRecord> {
        let path = self.record_path(info_hash);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => return None,
        };

        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(source) => {
                warn!(?path, %source, "discarding corrupt resume record");
                None
            }
        }
    }

    /// Write a resume record atomically (write-then-rename).
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be serialized or written.
    pub fn save(&self, record: &ResumeRecord) -> Result<(), ResumeError> {
        let path = self.record_path(record.info_hash);
        let json = serde_json::to_vec_pretty(record).map_err(|source| ResumeError::Corrupt {
            path: path.clone(),
            source,
        })?;
        self.write_atomically(&path, &json)
    }

    /// Delete a torrent's record, ignoring a record that never existed.
    ///
    /// # Errors
    ///
    /// Fails on filesystem errors other than `NotFound`.
    pub fn remove(&self, info_hash: InfoHash) -> Result<(), ResumeError> {
        let path = self.record_path(info_hash);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ResumeError::Io { path, source }),
        }
    }

    /// The startup registry. Missing or corrupt registries read as empty.
    #[must_use]
    pub fn load_registry(&self) -> Vec<RegistryEntry> {
        let path = self.registry_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => return Vec::new(),
        };

        match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(source) => {
                warn!(?path, %source, "discarding corrupt torrent registry");
                Vec::new()
            }
        }
    }

    /// Replace the startup registry.
    ///
    /// # Errors
    ///
    /// Fails when the registry cannot be written.
    pub fn save_registry(&self, entries: &[RegistryEntry]) -> Result<(), ResumeError> {
        let path = self.registry_path();
        let json = serde_json::to_vec_pretty(entries).map_err(|source| ResumeError::Corrupt {
            path: path.clone(),
            source,
        })?;
        self.write_atomically(&path, &json)
    }

    fn write_atomically(&self, path: &Path, bytes: &[u8]) -> Result<(), ResumeError> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|source| ResumeError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| ResumeError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let mut text = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            text.push_str(&format!("{byte:02x}"));
        }
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length hex string"));
        }
        text.as_bytes()
            .chunks_exact(2)
            .map(|chunk| {
                let hex = std::str::from_utf8(chunk).map_err(serde::de::Error::custom)?;
                u8::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
