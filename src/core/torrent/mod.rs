//! The torrent aggregate: status vocabulary, the public snapshot, the
//! command surface the engine drives a torrent with, and the spawn
//! arguments for the per-torrent pipeline task.
//!
//! One task owns each torrent ([`pipeline`]); everything else talks to it
//! through [`TorrentCommand`] messages on the handle. That single-owner
//! discipline is what serializes bitfield, piece-state and counter
//! transitions.
pub mod choke;
pub mod picker;
pub mod pipeline;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use riptide_configuration::Settings;
use riptide_metainfo::Metainfo;
use riptide_primitives::{InfoHash, PeerId, Priority};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::events::EventSender;
use crate::core::rate_limiter::RateLimiterPair;
use crate::core::resume::StateStore;
use crate::core::storage::Storage;
use crate::discovery::dht::DhtHandle;
use crate::discovery::lsd::LsdHandle;
use crate::discovery::EndpointRegistry;
use crate::protocol::handshake::Handshake;

pub type TorrentId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentStatus {
    /// Hash-scanning existing data.
    Checking,
    Stopped,
    Paused,
    Downloading,
    Seeding,
    Error,
}

impl std::fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TorrentStatus::Checking => "checking",
            TorrentStatus::Stopped => "stopped",
            TorrentStatus::Paused => "paused",
            TorrentStatus::Downloading => "downloading",
            TorrentStatus::Seeding => "seeding",
            TorrentStatus::Error => "error",
        };
        write!(f, "{label}")
    }
}

/// The short error surface shown to users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentError {
    pub kind: TorrentErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentErrorKind {
    Disk,
    Internal,
}

/// A cheap copy of everything the user-visible surface needs.
#[derive(Debug, Clone)]
pub struct TorrentSnapshot {
    pub id: TorrentId,
    pub info_hash: InfoHash,
    pub name: String,
    pub status: TorrentStatus,
    /// Verified share of wanted pieces, `0.0..=1.0`.
    pub progress: f64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub down_bps: u64,
    pub up_bps: u64,
    pub peers_total: usize,
    pub peers_connected: usize,
    pub peers_active: usize,
    pub swarm_complete: Option<u32>,
    pub swarm_incomplete: Option<u32>,
    pub error_count: u64,
    pub last_error: Option<TorrentError>,
}

/// Commands the engine sends into a torrent's pipeline task.
#[derive(Debug)]
pub enum TorrentCommand {
    Start,
    Pause,
    Stop,
    SetRateLimits {
        download_bps: Option<u64>,
        upload_bps: Option<u64>,
    },
    SetFilePriority {
        path: PathBuf,
        priority: Priority,
    },
    SetFileSelected {
        path: PathBuf,
        selected: bool,
    },
    /// Manually introduce an endpoint.
    AddPeer(SocketAddr),
    /// An accepted connection whose handshake matched this torrent.
    Incoming {
        addr: SocketAddr,
        stream: TcpStream,
        handshake: Handshake,
    },
    Snapshot(oneshot::Sender<TorrentSnapshot>),
}

/// The engine's grip on a running torrent task.
#[derive(Debug)]
pub struct TorrentHandle {
    pub id: TorrentId,
    pub info_hash: InfoHash,
    pub name: String,
    pub cmd: mpsc::Sender<TorrentCommand>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
}

impl TorrentHandle {
    pub fn command(&self, command: TorrentCommand) {
        let _ = self.cmd.try_send(command);
    }

    /// Request a snapshot; `None` when the task is gone.
    pub async fn snapshot(&self) -> Option<TorrentSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd.send(TorrentCommand::Snapshot(tx)).await.ok()?;
        rx.await.ok()
    }
}

/// Everything a torrent pipeline needs from the engine, fixed at spawn.
pub struct TorrentArgs {
    pub id: TorrentId,
    pub metainfo: Arc<Metainfo>,
    pub storage: Storage,
    pub torrent_file_path: PathBuf,
    pub download_path: PathBuf,
    pub settings: Arc<Settings>,
    pub state_store: StateStore,
    pub peer_id: PeerId,
    pub listen_port: u16,
    pub global_rate: Arc<RateLimiterPair>,
    pub registry: Arc<EndpointRegistry>,
    pub dht: Option<DhtHandle>,
    pub lsd: Option<LsdHandle>,
    pub events: EventSender,
    pub cancel: CancellationToken,
    /// Start paused instead of immediately downloading.
    pub start_stopped: bool,
}
