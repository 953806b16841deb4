//! The engine: one process-wide owner of many torrents.
//!
//! The engine owns the global rate limiters, the DHT node, the LSD
//! listener, the single incoming TCP listener and the observer dispatcher.
//! Each added torrent runs as its own pipeline task; the engine routes
//! accepted connections to the torrent whose info-hash the handshake
//! names, and fans lifecycle commands out through the torrent handles.
pub mod events;
pub mod rate_limiter;
pub mod resume;
pub mod session;
pub mod statistics;
pub mod storage;
pub mod torrent;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use riptide_configuration::{Settings, Validator};
use riptide_metainfo::Metainfo;
use riptide_primitives::{InfoHash, PeerId, Priority};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::events::{start_dispatcher, Event, EventSender, Observer};
use crate::core::rate_limiter::RateLimiterPair;
use crate::core::resume::{RegistryEntry, ResumeError, StateStore};
use crate::core::storage::{Storage, StorageError};
use crate::core::torrent::pipeline::spawn_torrent;
use crate::core::torrent::{TorrentArgs, TorrentCommand, TorrentHandle, TorrentId, TorrentSnapshot};
use crate::discovery::dht::DhtHandle;
use crate::discovery::lsd::LsdHandle;
use crate::discovery::EndpointRegistry;
use crate::protocol::handshake;

/// The listener port is chosen from this range, walking upward from a
/// random start until a port binds.
const LISTEN_PORT_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Grace given to each torrent task (and to the whole shutdown fan-out).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const HANDSHAKE_ROUTE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid settings: {0}")]
    Settings(#[from] riptide_configuration::SemanticValidationError),

    #[error("invalid torrent: {0}")]
    Metainfo(#[from] riptide_metainfo::Error),

    #[error("storage setup failed: {0}")]
    Storage(#[from] StorageError),

    #[error("state persistence failed: {0}")]
    Resume(#[from] ResumeError),

    #[error("no listen port available in the 49152..=65535 range")]
    NoListenPort,

    #[error("torrent {0} is already added")]
    DuplicateTorrent(InfoHash),

    #[error("no torrent with id {0}")]
    UnknownTorrent(TorrentId),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

struct TorrentRecord {
    handle: TorrentHandle,
    metainfo: Arc<Metainfo>,
    download_path: PathBuf,
    torrent_file_path: PathBuf,
}

struct EngineInner {
    settings: Arc<Settings>,
    peer_id: PeerId,
    listen_port: u16,
    state_store: StateStore,
    global_rate: Arc<RateLimiterPair>,
    registry: Arc<EndpointRegistry>,
    dht: Option<DhtHandle>,
    lsd: Option<LsdHandle>,
    events: EventSender,
    metrics: statistics::Repo,
    cancel: CancellationToken,
    torrents: Mutex<HashMap<TorrentId, TorrentRecord>>,
    next_id: AtomicU64,
}

/// Handle to the running engine. Clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Engine {
    /// Boot the engine: validate settings, pick a listen port, start the
    /// DHT, LSD, listener and observer dispatcher.
    ///
    /// # Errors
    ///
    /// Fails when the settings are inconsistent, the state directory is
    /// unusable or no listen port can be bound.
    pub async fn start(settings: Settings, observers: Vec<Arc<dyn Observer>>) -> Result<Self, EngineError> {
        settings.validate()?;

        let state_store = StateStore::new(&settings.state_path);
        state_store.init()?;

        let peer_id = PeerId::from_entropy(rand::thread_rng().gen());
        let (listener, listen_port) = bind_listener().await?;
        info!(%peer_id, listen_port, "engine starting");

        let cancel = CancellationToken::new();
        let dht = crate::discovery::dht::spawn(listen_port, cancel.child_token())
            .await
            .map(|(handle, _)| handle);
        let lsd = crate::discovery::lsd::spawn(listen_port, cancel.child_token()).await;

        // The metrics keeper observes ahead of user observers.
        let keeper = statistics::Keeper::new();
        let metrics = keeper.repo();
        let mut all_observers: Vec<Arc<dyn Observer>> = vec![Arc::new(keeper)];
        all_observers.extend(observers);
        let (events, dispatcher) = start_dispatcher(all_observers);

        let inner = Arc::new(EngineInner {
            global_rate: Arc::new(RateLimiterPair::new(
                settings.global_max_download_bps.filter(|bps| *bps > 0),
                settings.global_max_upload_bps.filter(|bps| *bps > 0),
            )),
            settings: Arc::new(settings),
            peer_id,
            listen_port,
            state_store,
            registry: Arc::new(EndpointRegistry::new(listen_port)),
            dht,
            lsd,
            events,
            metrics,
            cancel,
            torrents: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(run_listener(Arc::clone(&inner), listener));

        Ok(Self {
            inner,
            dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
        })
    }

    #[must_use]
    pub fn listen_port(&self) -> u16 {
        self.inner.listen_port
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// Process-wide metrics aggregated from the event stream.
    #[must_use]
    pub fn metrics(&self) -> statistics::Metrics {
        self.inner.metrics.snapshot()
    }

    /// Add a torrent from raw metainfo bytes and start it.
    ///
    /// # Errors
    ///
    /// Fails on malformed metainfo, unsafe paths, or a duplicate
    /// info-hash.
    pub fn add(
        &self,
        metainfo_bytes: &[u8],
        torrent_file_path: &Path,
        download_path: Option<&Path>,
    ) -> Result<TorrentId, EngineError> {
        let metainfo = Arc::new(Metainfo::parse(metainfo_bytes)?);
        let info_hash = metainfo.info_hash();

        let mut torrents = self.inner.torrents.lock().expect("torrent map lock poisoned");
        if torrents.values().any(|record| record.metainfo.info_hash() == info_hash) {
            return Err(EngineError::DuplicateTorrent(info_hash));
        }

        let download_path = download_path
            .unwrap_or(&self.inner.settings.default_download_path)
            .to_path_buf();
        let storage = Storage::new(Arc::clone(&metainfo), &download_path)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = spawn_torrent(TorrentArgs {
            id,
            metainfo: Arc::clone(&metainfo),
            storage,
            torrent_file_path: torrent_file_path.to_path_buf(),
            download_path: download_path.clone(),
            settings: Arc::clone(&self.inner.settings),
            state_store: self.inner.state_store.clone(),
            peer_id: self.inner.peer_id,
            listen_port: self.inner.listen_port,
            global_rate: Arc::clone(&self.inner.global_rate),
            registry: Arc::clone(&self.inner.registry),
            dht: self.inner.dht.clone(),
            lsd: self.inner.lsd.clone(),
            events: self.inner.events.clone(),
            cancel: self.inner.cancel.child_token(),
            start_stopped: false,
        });

        let name = handle.name.clone();
        torrents.insert(
            id,
            TorrentRecord {
                handle,
                metainfo,
                download_path,
                torrent_file_path: torrent_file_path.to_path_buf(),
            },
        );
        drop(torrents);

        self.save_registry();
        self.inner.events.send(Event::TorrentAdded { id, info_hash, name });
        Ok(id)
    }

    /// Re-add every torrent from `state_path/torrents.json`. Returns how
    /// many came back; unreadable entries are skipped with a warning.
    pub fn restore(&self) -> usize {
        let mut restored = 0;
        for RegistryEntry {
            info_hash,
            torrent_file_path,
            download_path,
        } in self.inner.state_store.load_registry()
        {
            match std::fs::read(&torrent_file_path) {
                Ok(bytes) => match self.add(&bytes, &torrent_file_path, Some(&download_path)) {
                    Ok(_) => restored += 1,
                    Err(source) => warn!(%info_hash, %source, "skipping unrestorable torrent"),
                },
                Err(source) => warn!(%info_hash, ?torrent_file_path, %source, "torrent file unreadable"),
            }
        }
        restored
    }

    /// # Errors
    ///
    /// Fails when `id` does not name a live torrent.
    pub fn start_torrent(&self, id: TorrentId) -> Result<(), EngineError> {
        self.command(id, TorrentCommand::Start)
    }

    /// # Errors
    ///
    /// Fails when `id` does not name a live torrent.
    pub fn pause(&self, id: TorrentId) -> Result<(), EngineError> {
        self.command(id, TorrentCommand::Pause)
    }

    /// # Errors
    ///
    /// Fails when `id` does not name a live torrent.
    pub fn stop(&self, id: TorrentId) -> Result<(), EngineError> {
        self.command(id, TorrentCommand::Stop)
    }

    /// # Errors
    ///
    /// Fails when `id` does not name a live torrent.
    pub fn set_rate_limits(&self, id: TorrentId, download_bps: Option<u64>, upload_bps: Option<u64>) -> Result<(), EngineError> {
        self.command(id, TorrentCommand::SetRateLimits { download_bps, upload_bps })
    }

    /// # Errors
    ///
    /// Fails when `id` does not name a live torrent.
    pub fn set_file_priority(&self, id: TorrentId, path: &Path, priority: Priority) -> Result<(), EngineError> {
        self.command(
            id,
            TorrentCommand::SetFilePriority {
                path: path.to_path_buf(),
                priority,
            },
        )
    }

    /// # Errors
    ///
    /// Fails when `id` does not name a live torrent.
    pub fn set_file_selected(&self, id: TorrentId, path: &Path, selected: bool) -> Result<(), EngineError> {
        self.command(
            id,
            TorrentCommand::SetFileSelected {
                path: path.to_path_buf(),
                selected,
            },
        )
    }

    /// Manually introduce a peer endpoint to a torrent.
    ///
    /// # Errors
    ///
    /// Fails when `id` does not name a live torrent.
    pub fn add_peer(&self, id: TorrentId, addr: SocketAddr) -> Result<(), EngineError> {
        self.command(id, TorrentCommand::AddPeer(addr))
    }

    /// # Errors
    ///
    /// Fails when `id` does not name a live torrent or its task died.
    pub async fn get_snapshot(&self, id: TorrentId) -> Result<TorrentSnapshot, EngineError> {
        let cmd = {
            let torrents = self.inner.torrents.lock().expect("torrent map lock poisoned");
            let record = torrents.get(&id).ok_or(EngineError::UnknownTorrent(id))?;
            record.handle.cmd.clone()
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        cmd.send(TorrentCommand::Snapshot(tx))
            .await
            .map_err(|_| EngineError::UnknownTorrent(id))?;
        rx.await.map_err(|_| EngineError::UnknownTorrent(id))
    }

    /// Snapshots of every torrent, in id order.
    pub async fn snapshots(&self) -> Vec<TorrentSnapshot> {
        let ids: Vec<TorrentId> = {
            let torrents = self.inner.torrents.lock().expect("torrent map lock poisoned");
            let mut ids: Vec<TorrentId> = torrents.keys().copied().collect();
            ids.sort_unstable();
            ids
        };

        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(snapshot) = self.get_snapshot(id).await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    /// Remove a torrent, optionally deleting its data files.
    ///
    /// # Errors
    ///
    /// Fails when `id` does not name a live torrent.
    pub async fn remove(&self, id: TorrentId, delete_files: bool) -> Result<(), EngineError> {
        let record = {
            let mut torrents = self.inner.torrents.lock().expect("torrent map lock poisoned");
            torrents.remove(&id).ok_or(EngineError::UnknownTorrent(id))?
        };
        let info_hash = record.metainfo.info_hash();

        record.handle.cancel.cancel();
        let _ = timeout(SHUTDOWN_GRACE, record.handle.join).await;

        if let Err(source) = self.inner.state_store.remove(info_hash) {
            warn!(%info_hash, %source, "failed removing resume record");
        }
        self.save_registry();

        if delete_files {
            delete_torrent_files(&record.metainfo, &record.download_path);
        }

        self.inner.events.send(Event::TorrentRemoved { id, info_hash });
        Ok(())
    }

    /// Graceful shutdown: stop every torrent (best-effort `stopped`
    /// announces capped by the shutdown grace), checkpoint resume records,
    /// close sessions and storage.
    pub async fn shutdown(&self) {
        info!("engine shutting down");

        let records: Vec<TorrentRecord> = {
            let mut torrents = self.inner.torrents.lock().expect("torrent map lock poisoned");
            torrents.drain().map(|(_, record)| record).collect()
        };

        for record in &records {
            record.handle.cancel.cancel();
        }
        for record in records {
            let _ = timeout(SHUTDOWN_GRACE, record.handle.join).await;
        }

        self.inner.cancel.cancel();
        if let Some(dispatcher) = self.dispatcher.lock().expect("dispatcher lock poisoned").take() {
            dispatcher.abort();
        }
    }

    fn command(&self, id: TorrentId, command: TorrentCommand) -> Result<(), EngineError> {
        let torrents = self.inner.torrents.lock().expect("torrent map lock poisoned");
        let record = torrents.get(&id).ok_or(EngineError::UnknownTorrent(id))?;
        record.handle.command(command);
        Ok(())
    }

    fn save_registry(&self) {
        let entries: Vec<RegistryEntry> = {
            let torrents = self.inner.torrents.lock().expect("torrent map lock poisoned");
            torrents
                .values()
                .map(|record| RegistryEntry {
                    info_hash: record.metainfo.info_hash(),
                    torrent_file_path: record.torrent_file_path.clone(),
                    download_path: record.download_path.clone(),
                })
                .collect()
        };
        if let Err(source) = self.inner.state_store.save_registry(&entries) {
            warn!(%source, "failed saving torrent registry");
        }
    }
}

/// Walk the dynamic port range from a random start until a bind succeeds.
async fn bind_listener() -> Result<(TcpListener, u16), EngineError> {
    let span = u32::from(LISTEN_PORT_RANGE.end() - LISTEN_PORT_RANGE.start()) + 1;
    let start: u32 = rand::thread_rng().gen_range(0..span);

    for offset in 0..span {
        let port = LISTEN_PORT_RANGE.start() + ((start + offset) % span) as u16;
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            return Ok((listener, port));
        }
    }
    Err(EngineError::NoListenPort)
}

/// Accept incoming connections and route each by the info-hash in its
/// handshake to the torrent that owns it.
async fn run_listener(inner: Arc<EngineInner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            () = inner.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let Ok((stream, addr)) = accepted else { continue };

        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            if let Err(source) = route_incoming(&inner, stream, addr).await {
                debug!(%addr, %source, "incoming connection dropped");
            }
        });
    }
}

async fn route_incoming(
    inner: &EngineInner,
    mut stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), crate::protocol::WireError> {
    let remote = timeout(HANDSHAKE_ROUTE_TIMEOUT, handshake::receive(&mut stream))
        .await
        .map_err(|_| {
            crate::protocol::WireError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "handshake timed out",
            ))
        })??;

    let cmd = {
        let torrents = inner.torrents.lock().expect("torrent map lock poisoned");
        torrents
            .values()
            .find(|record| record.metainfo.info_hash() == remote.info_hash)
            .map(|record| record.handle.cmd.clone())
    };

    match cmd {
        Some(cmd) => {
            debug!(%addr, info_hash = %remote.info_hash, "incoming peer routed");
            let _ = cmd
                .send(TorrentCommand::Incoming {
                    addr,
                    stream,
                    handshake: remote,
                })
                .await;
            Ok(())
        }
        None => Err(crate::protocol::WireError::InfoHashMismatch {
            expected: InfoHash::default(),
            actual: remote.info_hash,
        }),
    }
}

fn delete_torrent_files(metainfo: &Metainfo, download_path: &Path) {
    let root = match metainfo.directory() {
        Some(directory) => download_path.join(directory),
        None => download_path.to_path_buf(),
    };

    let mut dirs: Vec<PathBuf> = Vec::new();
    for file in metainfo.files() {
        let path = root.join(&file.path);
        if let Err(source) = std::fs::remove_file(&path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                warn!(?path, %source, "failed deleting torrent file");
            }
        }
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir == download_path || !dir.starts_with(download_path) {
                break;
            }
            if !dirs.contains(&dir.to_path_buf()) {
                dirs.push(dir.to_path_buf());
            }
            parent = dir.parent();
        }
    }

    // Deepest first; `remove_dir` only takes empty directories, so foreign
    // files keep their directories alive.
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in dirs {
        let _ = std::fs::remove_dir(dir);
    }
}
